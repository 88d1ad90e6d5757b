//! Sans-IO SOE engine holding the single client session slot.
//!
//! The engine consumes datagrams and timer ticks and returns what to put on
//! the wire, which payloads completed, and session lifecycle events. Socket
//! I/O and the backend link live elsewhere; the engine never blocks.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::packager::DEFAULT_MTU;
use crate::packets::{Channel, DisconnectReason, ServerNetworkStatus, SoePacket};
use crate::session::{ClientServer, Sequenced, Session, SessionState};

/// 2011-12-05 00:00 UTC, the origin of server sync stamps.
const SYNC_STAMP_EPOCH_SECS: u64 = 1_323_043_200;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum datagram size announced in `SessionResponse`. Default: 496.
    pub mtu: usize,
    /// Maximum unacknowledged packets per session. Default: 4096.
    pub max_in_flight: usize,
    /// Resend period before an RTT estimate exists. Default: 20 ms.
    pub resend_interval: Duration,
    /// Idle period after which a silent session is dropped. Default: 30 s.
    pub session_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            max_in_flight: 4096,
            resend_interval: Duration::from_millis(20),
            session_timeout: Duration::from_secs(30),
        }
    }
}

/// A datagram to send from one of the local listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub server: ClientServer,
    pub destination: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SessionOpened {
        server: ClientServer,
        connection_id: u32,
        source: SocketAddr,
    },
    SessionClosed {
        server: ClientServer,
        connection_id: u32,
        reason: DisconnectReason,
    },
    /// A client is waiting and the backend link is down.
    BackendConnectionRequested,
}

/// Everything produced by one engine call.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub transmits: Vec<Transmit>,
    /// Complete application payloads for the backend, in order.
    pub deliveries: Vec<Vec<u8>>,
    /// Raw payloads received on the ping listener.
    pub pings: Vec<Vec<u8>>,
    pub events: Vec<EngineEvent>,
}

#[derive(Debug, Clone, Copy)]
struct CachedRequest {
    server: ClientServer,
    source: SocketAddr,
    connection_id: u32,
}

/// The SOE protocol engine.
pub struct SoeEngine {
    config: EngineConfig,
    session: Option<Session>,
    backend_connected: bool,
    cached_request: Option<CachedRequest>,
}

impl SoeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: None,
            backend_connected: false,
            cached_request: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State of the session slot.
    pub fn state(&self) -> SessionState {
        match &self.session {
            Some(s) => SessionState::Connected(s.server()),
            None => SessionState::Disconnected,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn backend_connected(&self) -> bool {
        self.backend_connected
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one datagram received on `server`'s listener.
    pub fn handle_datagram(
        &mut self,
        server: ClientServer,
        source: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> EngineOutput {
        let mut out = EngineOutput::default();
        if server == ClientServer::Ping {
            self.handle_ping(source, bytes, &mut out);
            return out;
        }
        match SoePacket::decode(bytes) {
            Ok(packet) => self.process(server, source, packet, now, &mut out),
            Err(e) => tracing::warn!("[{source}]@{server} dropping malformed datagram: {e}"),
        }
        out
    }

    fn process(
        &mut self,
        server: ClientServer,
        source: SocketAddr,
        packet: SoePacket,
        now: Instant,
        out: &mut EngineOutput,
    ) {
        tracing::trace!("[{source}]@{server} received {packet}");
        match packet {
            SoePacket::SessionRequest { connection_id, .. } => {
                self.on_session_request(server, source, connection_id, now, out);
            }
            SoePacket::Disconnect {
                connection_id,
                reason,
            } => self.on_disconnect(server, source, connection_id, reason, out),
            SoePacket::MultiPacket(children) => {
                for child in children {
                    match SoePacket::decode(&child) {
                        Ok(packet) => self.process(server, source, packet, now, out),
                        Err(e) => tracing::warn!("[{source}]@{server} dropping sub-packet: {e}"),
                    }
                }
            }
            packet => self.on_session_packet(server, source, packet, now, out),
        }
    }

    fn on_session_request(
        &mut self,
        server: ClientServer,
        source: SocketAddr,
        connection_id: u32,
        now: Instant,
        out: &mut EngineOutput,
    ) {
        if !self.backend_connected {
            if self.cached_request.is_none() {
                out.events.push(EngineEvent::BackendConnectionRequested);
            }
            tracing::debug!("Backend offline, holding session request {connection_id} from {source}");
            self.cached_request = Some(CachedRequest {
                server,
                source,
                connection_id,
            });
            return;
        }

        if let Some(live) = &self.session {
            if live.connection_id() == connection_id || live.server() == server {
                tracing::debug!("Dropping duplicate session request {connection_id} on {server}");
                return;
            }
            if live.server() == ClientServer::Zone {
                tracing::debug!("Ignoring {server} session request while ZONE is active");
                return;
            }
            tracing::info!("{server} session {connection_id} supersedes {}", live.server());
            self.close_session(DisconnectReason::NewConnectionAttempt, out);
        }

        let session = Session::new(
            source,
            connection_id,
            server,
            self.config.mtu,
            self.config.resend_interval,
            now,
        );
        self.session = Some(session);
        push_transmit(out, server, source, &self.session_response(connection_id));
        out.events.push(EngineEvent::SessionOpened {
            server,
            connection_id,
            source,
        });
        tracing::info!("Opened {server} session {connection_id} for {source}");
    }

    fn on_disconnect(
        &mut self,
        server: ClientServer,
        source: SocketAddr,
        connection_id: u32,
        reason: DisconnectReason,
        out: &mut EngineOutput,
    ) {
        let matches = self.session.as_ref().is_some_and(|s| {
            s.source() == source && s.connection_id() == connection_id && s.server() == server
        });
        if matches {
            if let Some(session) = self.session.take() {
                tracing::info!("Client closed {server} session {connection_id}: {reason:?}");
                out.events.push(EngineEvent::SessionClosed {
                    server,
                    connection_id: session.connection_id(),
                    reason,
                });
            }
        } else {
            let reply = SoePacket::Disconnect {
                connection_id,
                reason: DisconnectReason::Application,
            };
            push_transmit(out, server, source, &reply);
        }
    }

    fn on_session_packet(
        &mut self,
        server: ClientServer,
        source: SocketAddr,
        packet: SoePacket,
        now: Instant,
        out: &mut EngineOutput,
    ) {
        if !self.backend_connected {
            tracing::trace!("[{source}]@{server} backend offline, dropping {packet}");
            return;
        }
        let max_in_flight = self.config.max_in_flight;
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.source() == source && s.server() == server)
        else {
            tracing::debug!("[{source}]@{server} no matching session, dropping {packet}");
            return;
        };
        session.touch(now);

        match packet {
            SoePacket::KeepAlive => push_transmit(out, server, source, &SoePacket::KeepAlive),
            SoePacket::ClientNetworkStatus(status) => {
                let reply = SoePacket::ServerNetworkStatus(ServerNetworkStatus {
                    client_tick: status.tick,
                    server_sync_stamp: server_sync_stamp(SystemTime::now()),
                    client_packets_sent: status.packets_sent,
                    client_packets_received: status.packets_received,
                    server_packets_sent: session.tx_total(),
                    server_packets_received: session.rx_total(),
                });
                push_transmit(out, server, source, &reply);
            }
            SoePacket::DataChannel {
                channel,
                sequence,
                payloads,
            } => Self::on_sequenced(
                session,
                channel,
                sequence,
                Sequenced::Data(payloads),
                out,
            ),
            SoePacket::Fragmented {
                channel,
                sequence,
                chunk,
            } => Self::on_sequenced(
                session,
                channel,
                sequence,
                Sequenced::Fragment(chunk),
                out,
            ),
            SoePacket::Acknowledge { sequence, .. } => {
                let cleared = session.outbound_mut().acknowledge(sequence, now);
                tracing::trace!("Acknowledge {sequence} cleared {cleared} packets");
                for bytes in session.flush(max_in_flight, now) {
                    out.transmits.push(Transmit {
                        server,
                        destination: source,
                        bytes,
                    });
                }
            }
            SoePacket::OutOfOrder { sequence, .. } => {
                if let Some(bytes) = session.outbound_mut().out_of_order(sequence, now) {
                    out.transmits.push(Transmit {
                        server,
                        destination: source,
                        bytes,
                    });
                }
            }
            SoePacket::Raw(bytes) => out.deliveries.push(bytes),
            other => tracing::debug!("[{source}]@{server} ignoring unexpected {other}"),
        }
    }

    fn on_sequenced(
        session: &mut Session,
        channel: Channel,
        sequence: u16,
        packet: Sequenced,
        out: &mut EngineOutput,
    ) {
        let server = session.server();
        let source = session.source();
        let outcome = session.receive(sequence, packet);
        for missing in outcome.out_of_order {
            let notice = SoePacket::OutOfOrder {
                channel,
                sequence: missing,
            };
            push_transmit(out, server, source, &notice);
        }
        if let Some(acked) = outcome.acknowledge {
            let ack = SoePacket::Acknowledge {
                channel,
                sequence: acked,
            };
            push_transmit(out, server, source, &ack);
        }
        out.deliveries.extend(outcome.deliveries);
    }

    fn handle_ping(&mut self, source: SocketAddr, bytes: &[u8], out: &mut EngineOutput) {
        match self.session.as_mut() {
            Some(session) if session.server() == ClientServer::Zone => {
                session.set_ping_source(source);
                out.pings.push(bytes.to_vec());
            }
            _ => tracing::trace!("[{source}]@PING no zone session, dropping ping"),
        }
    }

    // -----------------------------------------------------------------------
    // Backend link
    // -----------------------------------------------------------------------

    /// Record the backend link state. Connecting replays a held session
    /// request. Disconnecting tears the client session down and forgets any
    /// held request, so the client's next request asks for the backend again.
    pub fn set_backend_connected(&mut self, connected: bool, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        self.backend_connected = connected;
        if connected {
            if let Some(request) = self.cached_request.take() {
                tracing::debug!("Backend online, replaying session request {}", request.connection_id);
                self.on_session_request(
                    request.server,
                    request.source,
                    request.connection_id,
                    now,
                    &mut out,
                );
            }
        } else {
            self.cached_request = None;
            self.close_session(DisconnectReason::Application, &mut out);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Queue a payload for the client.
    ///
    /// `target` names the listener the payload belongs to; `None` means any
    /// live session. A payload for [`ClientServer::Ping`] goes out raw to the
    /// last ping source. When the target has no session the live session
    /// receives it instead.
    pub fn queue_outbound(&mut self, target: Option<ClientServer>, payload: Vec<u8>) -> EngineOutput {
        let mut out = EngineOutput::default();
        let Some(session) = self.session.as_mut() else {
            tracing::trace!("No session, dropping {} byte outbound payload", payload.len());
            return out;
        };
        match target {
            Some(ClientServer::Ping) => match session.ping_source() {
                Some(destination) => out.transmits.push(Transmit {
                    server: ClientServer::Ping,
                    destination,
                    bytes: payload,
                }),
                None => tracing::trace!("No ping source, dropping pong"),
            },
            Some(server) if server != session.server() => {
                tracing::trace!("No {server} session, routing to {}", session.server());
                session.queue(payload);
            }
            _ => session.queue(payload),
        }
        out
    }

    /// Package queued payloads and return first transmissions.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Transmit> {
        let max_in_flight = self.config.max_in_flight;
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let server = session.server();
        let destination = session.source();
        session
            .flush(max_in_flight, now)
            .into_iter()
            .map(|bytes| Transmit {
                server,
                destination,
                bytes,
            })
            .collect()
    }

    /// Timer tick: expire an idle session or run one resend cycle.
    pub fn on_timer(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        let timeout = self.config.session_timeout;
        if self.session.as_ref().is_some_and(|s| s.is_idle(now, timeout)) {
            tracing::warn!("Client session timed out after {timeout:?}");
            self.close_session(DisconnectReason::Timeout, &mut out);
            return out;
        }
        if let Some(session) = self.session.as_mut() {
            let server = session.server();
            let destination = session.source();
            let resent = session.outbound_mut().resend_cycle(now);
            out.transmits.extend(resent.into_iter().map(|bytes| Transmit {
                server,
                destination,
                bytes,
            }));
        }
        out
    }

    /// Delay before the next [`SoeEngine::on_timer`] call.
    pub fn next_timer_delay(&self) -> Duration {
        match &self.session {
            Some(s) => s.outbound().resend_delay(),
            None => self.config.resend_interval,
        }
    }

    /// Close the session, telling the client why.
    pub fn close(&mut self, reason: DisconnectReason) -> EngineOutput {
        let mut out = EngineOutput::default();
        self.close_session(reason, &mut out);
        out
    }

    /// Final teardown: best-effort `Disconnect` to the client and all state
    /// discarded.
    pub fn shutdown(&mut self) -> EngineOutput {
        self.cached_request = None;
        self.close(DisconnectReason::Application)
    }

    fn close_session(&mut self, reason: DisconnectReason, out: &mut EngineOutput) {
        let Some(session) = self.session.take() else {
            return;
        };
        let disconnect = SoePacket::Disconnect {
            connection_id: session.connection_id(),
            reason,
        };
        push_transmit(out, session.server(), session.source(), &disconnect);
        out.events.push(EngineEvent::SessionClosed {
            server: session.server(),
            connection_id: session.connection_id(),
            reason,
        });
        tracing::info!(
            "Closed {} session {}: {reason:?}",
            session.server(),
            session.connection_id()
        );
    }

    fn session_response(&self, connection_id: u32) -> SoePacket {
        SoePacket::SessionResponse {
            connection_id,
            crc_seed: 0,
            crc_length: 0,
            encryption_flag: 0,
            xor_length: 0,
            udp_size: self.config.mtu as u32,
        }
    }
}

fn push_transmit(
    out: &mut EngineOutput,
    server: ClientServer,
    destination: SocketAddr,
    packet: &SoePacket,
) {
    out.transmits.push(Transmit {
        server,
        destination,
        bytes: packet.encode(),
    });
}

/// Milliseconds since 2011-12-05 00:00 UTC, wrapped to 32 bits.
pub fn server_sync_stamp(now: SystemTime) -> u32 {
    let epoch = UNIX_EPOCH + Duration::from_secs(SYNC_STAMP_EPOCH_SECS);
    now.duration_since(epoch)
        .map(|elapsed| elapsed.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn request(connection_id: u32) -> Vec<u8> {
        SoePacket::SessionRequest {
            crc_length: 0,
            connection_id,
            udp_size: 496,
        }
        .encode()
    }

    fn online_engine() -> SoeEngine {
        let mut engine = SoeEngine::new(EngineConfig::default());
        engine.set_backend_connected(true, Instant::now());
        engine
    }

    fn decoded(out: &EngineOutput) -> Vec<SoePacket> {
        out.transmits
            .iter()
            .map(|t| SoePacket::decode(&t.bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_session_request_held_until_backend_connects() {
        let mut engine = SoeEngine::new(EngineConfig::default());
        let now = Instant::now();
        let out = engine.handle_datagram(ClientServer::Login, client(), &request(7), now);
        assert!(out.transmits.is_empty());
        assert_eq!(out.events, vec![EngineEvent::BackendConnectionRequested]);
        assert_eq!(engine.state(), SessionState::Disconnected);

        let out = engine.set_backend_connected(true, now);
        assert_eq!(engine.state(), SessionState::Connected(ClientServer::Login));
        assert!(matches!(
            decoded(&out)[0],
            SoePacket::SessionResponse {
                connection_id: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_backend_forgets_held_request() {
        let mut engine = SoeEngine::new(EngineConfig::default());
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(7), now);
        let out = engine.handle_datagram(ClientServer::Login, client(), &request(7), now);
        assert!(out.events.is_empty());

        engine.set_backend_connected(false, now);
        let out = engine.handle_datagram(ClientServer::Login, client(), &request(8), now);
        assert_eq!(out.events, vec![EngineEvent::BackendConnectionRequested]);
    }

    #[test]
    fn test_zone_supersedes_login() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(1), now);
        let zone_client: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let out = engine.handle_datagram(ClientServer::Zone, zone_client, &request(2), now);

        assert_eq!(engine.state(), SessionState::Connected(ClientServer::Zone));
        assert_eq!(out.transmits[0].destination, client());
        assert_eq!(
            decoded(&out)[0],
            SoePacket::Disconnect {
                connection_id: 1,
                reason: DisconnectReason::NewConnectionAttempt
            }
        );
        assert_eq!(out.transmits[1].destination, zone_client);
    }

    #[test]
    fn test_login_does_not_supersede_zone() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Zone, client(), &request(1), now);
        let out = engine.handle_datagram(ClientServer::Login, client(), &request(2), now);
        assert!(out.transmits.is_empty());
        assert_eq!(engine.session().unwrap().connection_id(), 1);
    }

    #[test]
    fn test_duplicate_server_request_dropped() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(1), now);
        let other: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let out = engine.handle_datagram(ClientServer::Login, other, &request(9), now);
        assert!(out.transmits.is_empty());
        assert_eq!(engine.session().unwrap().connection_id(), 1);
    }

    #[test]
    fn test_matching_disconnect_closes_session() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let bye = SoePacket::Disconnect {
            connection_id: 5,
            reason: DisconnectReason::Application,
        }
        .encode();
        let out = engine.handle_datagram(ClientServer::Login, client(), &bye, now);
        assert!(out.transmits.is_empty());
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_foreign_disconnect_is_answered() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let bye = SoePacket::Disconnect {
            connection_id: 6,
            reason: DisconnectReason::Timeout,
        }
        .encode();
        let out = engine.handle_datagram(ClientServer::Login, client(), &bye, now);
        assert_eq!(
            decoded(&out),
            vec![SoePacket::Disconnect {
                connection_id: 6,
                reason: DisconnectReason::Application
            }]
        );
        assert_eq!(engine.state(), SessionState::Connected(ClientServer::Login));
    }

    #[test]
    fn test_keep_alive_and_network_status_answered() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);

        let out = engine.handle_datagram(ClientServer::Login, client(), &[0x00, 0x06], now);
        assert_eq!(decoded(&out), vec![SoePacket::KeepAlive]);

        let status = SoePacket::ClientNetworkStatus(crate::packets::ClientNetworkStatus {
            tick: 42,
            packets_sent: 3,
            packets_received: 4,
            ..Default::default()
        })
        .encode();
        let out = engine.handle_datagram(ClientServer::Login, client(), &status, now);
        match &decoded(&out)[0] {
            SoePacket::ServerNetworkStatus(s) => {
                assert_eq!(s.client_tick, 42);
                assert_eq!(s.client_packets_sent, 3);
                assert_eq!(s.client_packets_received, 4);
                assert_eq!(s.server_packets_sent, 0);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_multi_packet_children_processed_in_order() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let data = |seq: u16, byte: u8| {
            SoePacket::DataChannel {
                channel: Channel::A,
                sequence: seq,
                payloads: vec![vec![byte, 0, 0, 0, 0, 0]],
            }
            .encode()
        };
        let multi = SoePacket::MultiPacket(vec![data(0, 1), data(1, 2)]).encode();
        let out = engine.handle_datagram(ClientServer::Login, client(), &multi, now);
        assert_eq!(out.deliveries.len(), 2);
        assert_eq!(out.deliveries[0][0], 1);
        assert_eq!(out.deliveries[1][0], 2);
    }

    #[test]
    fn test_traffic_from_other_source_dropped() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let stranger: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let packet = SoePacket::DataChannel {
            channel: Channel::A,
            sequence: 0,
            payloads: vec![vec![1, 2, 3]],
        }
        .encode();
        let out = engine.handle_datagram(ClientServer::Login, stranger, &packet, now);
        assert!(out.deliveries.is_empty());
        assert!(out.transmits.is_empty());
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let mut engine = online_engine();
        let out = engine.handle_datagram(ClientServer::Login, client(), &[0x00], Instant::now());
        assert!(out.transmits.is_empty());
        assert!(out.deliveries.is_empty());
    }

    #[test]
    fn test_outbound_flush_ack_and_resend() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);

        engine.queue_outbound(Some(ClientServer::Login), vec![7; 20]);
        let sent = engine.poll_transmit(now);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            SoePacket::decode(&sent[0].bytes).unwrap(),
            SoePacket::DataChannel { sequence: 0, .. }
        ));

        let resent = engine.on_timer(now + Duration::from_millis(20));
        assert_eq!(resent.transmits.len(), 1);

        let ack = SoePacket::Acknowledge {
            channel: Channel::A,
            sequence: 0,
        }
        .encode();
        engine.handle_datagram(ClientServer::Login, client(), &ack, now);
        let resent = engine.on_timer(now + Duration::from_millis(40));
        assert!(resent.transmits.is_empty());
    }

    #[test]
    fn test_outbound_falls_back_to_live_session() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        engine.queue_outbound(Some(ClientServer::Zone), vec![1; 8]);
        assert_eq!(engine.poll_transmit(now).len(), 1);
    }

    #[test]
    fn test_ping_roundtrip_needs_zone_session() {
        let mut engine = online_engine();
        let now = Instant::now();
        let pinger: SocketAddr = "127.0.0.1:42000".parse().unwrap();
        let out = engine.handle_datagram(ClientServer::Ping, pinger, &[1, 2, 3, 4], now);
        assert!(out.pings.is_empty());

        engine.handle_datagram(ClientServer::Zone, client(), &request(5), now);
        let out = engine.handle_datagram(ClientServer::Ping, pinger, &[1, 2, 3, 4], now);
        assert_eq!(out.pings, vec![vec![1, 2, 3, 4]]);

        let out = engine.queue_outbound(Some(ClientServer::Ping), vec![1, 2, 3, 4]);
        assert_eq!(
            out.transmits,
            vec![Transmit {
                server: ClientServer::Ping,
                destination: pinger,
                bytes: vec![1, 2, 3, 4],
            }]
        );
    }

    #[test]
    fn test_idle_session_times_out() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let out = engine.on_timer(now + Duration::from_secs(31));
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert_eq!(
            decoded(&out),
            vec![SoePacket::Disconnect {
                connection_id: 5,
                reason: DisconnectReason::Timeout
            }]
        );
    }

    #[test]
    fn test_backend_loss_closes_session() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Login, client(), &request(5), now);
        let out = engine.set_backend_connected(false, now);
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(matches!(
            out.events[0],
            EngineEvent::SessionClosed {
                reason: DisconnectReason::Application,
                ..
            }
        ));
    }

    #[test]
    fn test_shutdown_sends_disconnect() {
        let mut engine = online_engine();
        let now = Instant::now();
        engine.handle_datagram(ClientServer::Zone, client(), &request(5), now);
        let out = engine.shutdown();
        assert_eq!(out.transmits.len(), 1);
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(engine.shutdown().transmits.is_empty());
    }

    #[test]
    fn test_sync_stamp_epoch() {
        let epoch = UNIX_EPOCH + Duration::from_secs(SYNC_STAMP_EPOCH_SECS);
        assert_eq!(server_sync_stamp(epoch), 0);
        assert_eq!(server_sync_stamp(epoch + Duration::from_millis(1500)), 1500);
        assert_eq!(server_sync_stamp(UNIX_EPOCH), 0);
    }
}
