//! TCP client for the Holocore backend.
//!
//! Manages the full connection lifecycle: connect with timeout, the protocol
//! version handshake, heartbeat keepalive, and an orderly
//! `HoloConnectionStopped` on the way out. State changes are broadcast via a
//! [`watch`] channel so any number of consumers can react without polling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::framing::{self, FrameBuffer, FrameConfig, FrameError};
use crate::messages::{
    self, ConnectionStoppedReason, HeartBeat, HoloConnectionStarted, HoloConnectionStopped,
    HoloSetProtocolVersion, SwgMessage,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect or handshake in progress.
    Connecting,
    /// Handshake complete, payloads flow both ways.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Tunables for the backend connection.
#[derive(Debug, Clone)]
pub struct HolocoreConfig {
    /// TCP connect timeout. Default: 5 s.
    pub connect_timeout: Duration,
    /// Time allowed for the backend to answer the version handshake. Default: 5 s.
    pub handshake_timeout: Duration,
    /// Interval between outgoing heartbeats. Default: 10 s.
    pub heartbeat_interval: Duration,
    /// Silence after which the backend is declared dead. Default: 21 s.
    pub heartbeat_timeout: Duration,
    /// IP type-of-service byte. Default: `0x10` (low delay).
    pub tos: u32,
    pub frame: FrameConfig,
}

impl Default for HolocoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(21),
            tos: 0x10,
            frame: FrameConfig::default(),
        }
    }
}

/// Errors produced by the backend client.
#[derive(Debug, thiserror::Error)]
pub enum HolocoreError {
    /// The connection is gone: peer closed it, a send failed, or it was stopped.
    #[error("connection to backend lost")]
    ConnectionLost,
    /// The backend rejected our protocol version.
    #[error("backend rejected protocol version {}", messages::HOLOCORE_PROTOCOL)]
    ProtocolMismatch,
    /// Connect or handshake did not finish in time.
    #[error("timed out connecting to backend")]
    Timeout,
    /// The stream carried a malformed frame.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn configure_stream(stream: &TcpStream, tos: u32) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tos(tos) {
        tracing::warn!("Could not set TOS 0x{tos:02X} on backend socket: {e}");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Handle to an established backend connection.
///
/// Created via [`HolocoreClient::connect`]. Outgoing payloads are queued to a
/// writer task, so [`send`](Self::send) never blocks. Dropping the handle
/// stops the background tasks without notifying the backend.
pub struct HolocoreClient {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<ConnectionStateWatch>,
    /// Sending `true` causes reader, writer, and heartbeat tasks to exit.
    shutdown: Arc<watch::Sender<bool>>,
}

impl HolocoreClient {
    /// Connect to the backend at `addr` and complete the version handshake.
    ///
    /// Returns the client and a receiver yielding every payload the backend
    /// sends afterwards. The receiver closes when the connection ends.
    pub async fn connect(
        addr: SocketAddr,
        config: HolocoreConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>), HolocoreError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let (stream, buffer) = match Self::establish(addr, &config).await {
            Ok(established) => established,
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        state.set(ConnectionState::Connected);
        tracing::info!("Connected to backend at {addr}");

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (alive_tx, alive_rx) = watch::channel(Instant::now());

        tokio::spawn(Self::read_loop(
            reader,
            buffer,
            inbound_tx,
            alive_tx,
            Arc::clone(&state),
            Arc::clone(&shutdown),
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::write_loop(
            writer,
            outbound_rx,
            config.frame.clone(),
            Arc::clone(&state),
            Arc::clone(&shutdown),
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::heartbeat_loop(
            outbound_tx.clone(),
            alive_rx,
            config.heartbeat_interval,
            config.heartbeat_timeout,
            Arc::clone(&state),
            Arc::clone(&shutdown),
            shutdown_rx,
        ));

        let client = Self {
            remote: addr,
            outbound: outbound_tx,
            state,
            shutdown,
        };
        Ok((client, inbound_rx))
    }

    async fn establish(
        addr: SocketAddr,
        config: &HolocoreConfig,
    ) -> Result<(TcpStream, FrameBuffer), HolocoreError> {
        let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HolocoreError::Timeout)??;
        configure_stream(&stream, config.tos)?;

        let mut buffer = FrameBuffer::new();
        let hello = HoloSetProtocolVersion::default().encode();
        framing::write_frame(&mut stream, &hello, &config.frame).await?;
        tokio::time::timeout(
            config.handshake_timeout,
            Self::await_started(&mut stream, &mut buffer),
        )
        .await
        .map_err(|_| HolocoreError::Timeout)??;
        framing::write_frame(&mut stream, &HoloConnectionStarted.encode(), &config.frame).await?;
        Ok((stream, buffer))
    }

    async fn await_started(
        stream: &mut TcpStream,
        buffer: &mut FrameBuffer,
    ) -> Result<(), HolocoreError> {
        loop {
            let payload = framing::read_frame(stream, buffer).await?;
            match messages::message_crc(&payload) {
                Some(messages::HOLO_CONNECTION_STARTED) => return Ok(()),
                Some(messages::HOLO_CONNECTION_STOPPED) => {
                    let reason = HoloConnectionStopped::decode(&payload)
                        .map(|m| m.reason)
                        .unwrap_or_default();
                    tracing::warn!("Backend refused connection: {reason}");
                    return Err(match reason {
                        ConnectionStoppedReason::InvalidProtocol => HolocoreError::ProtocolMismatch,
                        _ => HolocoreError::ConnectionLost,
                    });
                }
                _ => tracing::trace!("Ignoring {} byte payload during handshake", payload.len()),
            }
        }
    }

    /// Address of the backend.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.current() == ConnectionState::Connected
    }

    /// Queue `payload` for the backend.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), HolocoreError> {
        if !self.is_connected() {
            return Err(HolocoreError::ConnectionLost);
        }
        self.outbound
            .send(payload)
            .map_err(|_| HolocoreError::ConnectionLost)
    }

    /// Tell the backend why we are leaving, then close the connection.
    ///
    /// Transitions to [`ConnectionState::Disconnected`] immediately; the
    /// writer task flushes the stop message before closing the socket.
    pub fn disconnect(&self, reason: ConnectionStoppedReason) {
        if self.state.current() == ConnectionState::Disconnected {
            return;
        }
        tracing::info!("Terminating backend connection: {reason}");
        let _ = self
            .outbound
            .send(HoloConnectionStopped::new(reason).encode());
        let _ = self.shutdown.send(true);
        self.state.set(ConnectionState::Disconnected);
    }

    /// Wait until the connection is [`ConnectionState::Disconnected`].
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current == ConnectionState::Disconnected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Forward backend payloads until the stream ends or shutdown is signalled.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        mut buffer: FrameBuffer,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        alive: watch::Sender<Instant>,
        state: Arc<ConnectionStateWatch>,
        shutdown: Arc<watch::Sender<bool>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = framing::read_frame(&mut reader, &mut buffer) => {
                    match result {
                        Ok(payload) => {
                            alive.send_replace(Instant::now());
                            if messages::message_crc(&payload) == Some(messages::HOLO_CONNECTION_STOPPED) {
                                let reason = HoloConnectionStopped::decode(&payload)
                                    .map(|m| m.reason)
                                    .unwrap_or_default();
                                tracing::info!("Backend closed the connection: {reason}");
                                break;
                            }
                            if inbound.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(FrameError::Decompress(e)) => {
                            tracing::warn!("Dropping backend frame: {e}");
                        }
                        Err(FrameError::ConnectionClosed) => {
                            tracing::info!("Backend closed the stream");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Backend read failed: {e}");
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        state.set(ConnectionState::Disconnected);
        let _ = shutdown.send(true);
    }

    /// Write queued payloads in order. Anything queued before shutdown is
    /// still flushed.
    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        config: FrameConfig,
        state: Arc<ConnectionStateWatch>,
        shutdown: Arc<watch::Sender<bool>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut healthy = true;
        loop {
            tokio::select! {
                biased;
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    match framing::write_frame(&mut writer, &payload, &config).await {
                        Ok(()) => {}
                        Err(FrameError::PayloadTooLarge { size, max }) => {
                            tracing::warn!("Dropping {size} byte payload, backend frames hold at most {max}");
                        }
                        Err(e) => {
                            tracing::warn!("Backend write failed: {e}");
                            healthy = false;
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if healthy {
            while let Ok(payload) = outbound.try_recv() {
                if framing::write_frame(&mut writer, &payload, &config).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        state.set(ConnectionState::Disconnected);
        let _ = shutdown.send(true);
    }

    /// Send a heartbeat every `interval`; declare the link dead after
    /// `timeout` without any inbound frame.
    async fn heartbeat_loop(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        alive: watch::Receiver<Instant>,
        interval: Duration,
        timeout: Duration,
        state: Arc<ConnectionStateWatch>,
        shutdown: Arc<watch::Sender<bool>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        let beat = HeartBeat::default().encode();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if state.current() != ConnectionState::Connected {
                        break;
                    }
                    let silent_for = alive.borrow().elapsed();
                    if silent_for > timeout {
                        tracing::warn!("Backend heartbeat timeout, nothing received in {silent_for:?}");
                        state.set(ConnectionState::Disconnected);
                        let _ = shutdown.send(true);
                        break;
                    }
                    if outbound.send(beat.clone()).is_err() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for HolocoreClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config() -> HolocoreConfig {
        HolocoreConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    /// Read frames until one that is not a plain heartbeat arrives.
    async fn next_payload(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Vec<u8> {
        loop {
            let payload = framing::read_frame(stream, buffer).await.unwrap();
            if payload != HeartBeat::default().encode() {
                return payload;
            }
        }
    }

    /// Accept one connection and complete the handshake from the server side.
    async fn handshaking_backend() -> (SocketAddr, tokio::task::JoinHandle<(TcpStream, FrameBuffer)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = FrameBuffer::new();
            let hello = framing::read_frame(&mut stream, &mut buffer).await.unwrap();
            let version = HoloSetProtocolVersion::decode(&hello).unwrap();
            assert_eq!(version.protocol, messages::HOLOCORE_PROTOCOL);
            let config = FrameConfig::default();
            framing::write_frame(&mut stream, &HoloConnectionStarted.encode(), &config)
                .await
                .unwrap();
            let reply = framing::read_frame(&mut stream, &mut buffer).await.unwrap();
            assert_eq!(reply, HoloConnectionStarted.encode());
            (stream, buffer)
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connection_state_transitions() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
        watch.set(ConnectionState::Connecting);
        assert_eq!(watch.current(), ConnectionState::Connecting);
        watch.set(ConnectionState::Connected);
        assert_eq!(watch.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_then_payloads_flow_both_ways() {
        let (addr, backend) = handshaking_backend().await;
        let (client, mut inbound) = HolocoreClient::connect(addr, fast_config()).await.unwrap();
        assert!(client.is_connected());
        let (mut stream, mut buffer) = backend.await.unwrap();

        let upstream: Vec<u8> = (0..100u8).collect();
        client.send(upstream.clone()).unwrap();
        assert_eq!(next_payload(&mut stream, &mut buffer).await, upstream);

        let downstream = vec![7u8; 300];
        framing::write_frame(&mut stream, &downstream, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), downstream);
    }

    #[tokio::test]
    async fn test_protocol_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = FrameBuffer::new();
            let _hello = framing::read_frame(&mut stream, &mut buffer).await.unwrap();
            let refusal = HoloConnectionStopped::new(ConnectionStoppedReason::InvalidProtocol);
            framing::write_frame(&mut stream, &refusal.encode(), &FrameConfig::default())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let result = HolocoreClient::connect(addr, fast_config()).await;
        assert!(matches!(result, Err(HolocoreError::ProtocolMismatch)));
    }

    #[tokio::test]
    async fn test_silent_backend_times_out_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let result = HolocoreClient::connect(addr, fast_config()).await;
        assert!(matches!(result, Err(HolocoreError::Timeout)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = HolocoreClient::connect(addr, fast_config()).await;
        assert!(matches!(result, Err(HolocoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        let (addr, backend) = handshaking_backend().await;
        let config = HolocoreConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let (client, _inbound) = HolocoreClient::connect(addr, config).await.unwrap();
        let _held_open = backend.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("heartbeat timeout should close the connection");
        assert!(matches!(
            client.send(vec![1, 2, 3]),
            Err(HolocoreError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_heartbeats_are_sent() {
        let (addr, backend) = handshaking_backend().await;
        let config = HolocoreConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..fast_config()
        };
        let (_client, _inbound) = HolocoreClient::connect(addr, config).await.unwrap();
        let (mut stream, mut buffer) = backend.await.unwrap();

        let payload = framing::read_frame(&mut stream, &mut buffer).await.unwrap();
        assert_eq!(messages::message_crc(&payload), Some(messages::HEART_BEAT));
    }

    #[tokio::test]
    async fn test_disconnect_sends_stop_reason() {
        let (addr, backend) = handshaking_backend().await;
        let (client, _inbound) = HolocoreClient::connect(addr, fast_config()).await.unwrap();
        let (mut stream, mut buffer) = backend.await.unwrap();

        client.disconnect(ConnectionStoppedReason::Application);
        assert_eq!(client.state().current(), ConnectionState::Disconnected);

        let stop = next_payload(&mut stream, &mut buffer).await;
        let stop = HoloConnectionStopped::decode(&stop).unwrap();
        assert_eq!(stop.reason, ConnectionStoppedReason::Application);
    }

    #[tokio::test]
    async fn test_backend_stop_closes_connection() {
        let (addr, backend) = handshaking_backend().await;
        let (client, mut inbound) = HolocoreClient::connect(addr, fast_config()).await.unwrap();
        let (mut stream, _buffer) = backend.await.unwrap();

        let stop = HoloConnectionStopped::new(ConnectionStoppedReason::Application);
        framing::write_frame(&mut stream, &stop.encode(), &FrameConfig::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .unwrap();
        assert!(inbound.recv().await.is_none());
    }
}
