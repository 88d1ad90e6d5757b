//! Per-connection SOE session state.
//!
//! Tracks identity (source endpoint, connection id, server), the inbound
//! reorder queue and fragment reassembly, and the outbound packager and
//! retransmission buffer.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::fragments::FragmentReassembler;
use crate::outbound::OutboundBuffer;
use crate::packager::Packager;
use crate::sequence::{self, SEQUENCE_WINDOW};

/// Which local listener a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientServer {
    Login,
    Zone,
    Ping,
}

impl fmt::Display for ClientServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientServer::Login => "LOGIN",
            ClientServer::Zone => "ZONE",
            ClientServer::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the engine's single session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected(ClientServer),
}

/// A reliable packet waiting in the reorder queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced {
    Data(Vec<Vec<u8>>),
    Fragment(Vec<u8>),
}

/// How an inbound sequenced packet was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    /// Head of line: it and any queued successors were delivered.
    Delivered,
    /// Ahead of the expected sequence; held until the gap fills.
    Buffered,
    /// Behind the expected sequence, or already queued.
    Duplicate,
}

/// Result of feeding one sequenced packet to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOutcome {
    pub status: InboundStatus,
    /// Application payloads now complete, in order.
    pub deliveries: Vec<Vec<u8>>,
    /// Cumulative acknowledgement to send, if any.
    pub acknowledge: Option<u16>,
    /// Missing sequences to report as out of order.
    pub out_of_order: Vec<u16>,
}

impl InboundOutcome {
    fn new(status: InboundStatus) -> Self {
        Self {
            status,
            deliveries: Vec::new(),
            acknowledge: None,
            out_of_order: Vec::new(),
        }
    }
}

/// One live client session.
pub struct Session {
    source: SocketAddr,
    connection_id: u32,
    server: ClientServer,

    /// Next sequence expected from the client.
    rx_sequence: u16,
    /// Packets delivered so far; the absolute position of `rx_sequence`.
    rx_total: u64,
    /// Out-of-order packets keyed by absolute position.
    reorder: BTreeMap<u64, Sequenced>,
    /// Gap positions below this have already been reported.
    reported_until: u64,
    reassembler: FragmentReassembler,

    /// Next sequence to assign to an outbound packet.
    tx_sequence: u16,
    tx_total: u64,
    pending: VecDeque<Vec<u8>>,
    packager: Packager,
    outbound: OutboundBuffer,

    ping_source: Option<SocketAddr>,
    last_activity: Instant,
}

impl Session {
    /// Start a session for a freshly accepted `SessionRequest`.
    pub fn new(
        source: SocketAddr,
        connection_id: u32,
        server: ClientServer,
        mtu: usize,
        resend_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            source,
            connection_id,
            server,
            rx_sequence: 0,
            rx_total: 0,
            reorder: BTreeMap::new(),
            reported_until: 0,
            reassembler: FragmentReassembler::new(),
            tx_sequence: 0,
            tx_total: 0,
            pending: VecDeque::new(),
            packager: Packager::new(mtu),
            outbound: OutboundBuffer::new(resend_interval),
            ping_source: None,
            last_activity: now,
        }
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server(&self) -> ClientServer {
        self.server
    }

    /// Next sequence expected from the client.
    pub fn rx_sequence(&self) -> u16 {
        self.rx_sequence
    }

    /// Reliable packets received in order.
    pub fn rx_total(&self) -> u64 {
        self.rx_total
    }

    /// Reliable packets handed to the outbound buffer.
    pub fn tx_total(&self) -> u64 {
        self.tx_total
    }

    pub fn ping_source(&self) -> Option<SocketAddr> {
        self.ping_source
    }

    pub fn set_ping_source(&mut self, source: SocketAddr) {
        self.ping_source = Some(source);
    }

    pub fn outbound(&self) -> &OutboundBuffer {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut OutboundBuffer {
        &mut self.outbound
    }

    /// Update the activity timestamp used for idle timeouts.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// `true` once nothing has arrived for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Insert a sequenced packet and deliver everything now contiguous.
    pub fn receive(&mut self, sequence: u16, packet: Sequenced) -> InboundOutcome {
        let distance = sequence::forward_distance(self.rx_sequence, sequence);
        if distance >= SEQUENCE_WINDOW {
            tracing::trace!(
                "Stale sequence {sequence} (expecting {}), re-acknowledging",
                self.rx_sequence
            );
            let mut outcome = InboundOutcome::new(InboundStatus::Duplicate);
            if self.rx_total > 0 {
                outcome.acknowledge = Some(self.rx_sequence.wrapping_sub(1));
            }
            return outcome;
        }

        let position = self.rx_total + u64::from(distance);
        if self.reorder.contains_key(&position) {
            return InboundOutcome::new(InboundStatus::Duplicate);
        }
        self.reorder.insert(position, packet);

        let mut outcome = InboundOutcome::new(InboundStatus::Buffered);
        while let Some(entry) = self.reorder.first_entry() {
            if *entry.key() != self.rx_total {
                break;
            }
            let packet = entry.remove();
            self.rx_sequence = self.rx_sequence.wrapping_add(1);
            self.rx_total += 1;
            outcome.status = InboundStatus::Delivered;
            self.deliver(packet, &mut outcome.deliveries);
        }

        if outcome.status == InboundStatus::Delivered {
            outcome.acknowledge = Some(self.rx_sequence.wrapping_sub(1));
        }

        if let Some((&head, _)) = self.reorder.first_key_value() {
            let from = self.reported_until.max(self.rx_total);
            for missing in from..head {
                let offset = (missing - self.rx_total) as u16;
                outcome
                    .out_of_order
                    .push(self.rx_sequence.wrapping_add(offset));
            }
            self.reported_until = self.reported_until.max(head);
        }
        outcome
    }

    fn deliver(&mut self, packet: Sequenced, deliveries: &mut Vec<Vec<u8>>) {
        match packet {
            Sequenced::Data(payloads) => deliveries.extend(payloads),
            Sequenced::Fragment(chunk) => match self.reassembler.push(&chunk) {
                Ok(Some(payload)) => deliveries.push(payload),
                Ok(None) => {}
                Err(e) => tracing::warn!("Dropping fragmented payload: {e}"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Queue an application payload for packaging.
    pub fn queue(&mut self, payload: Vec<u8>) {
        self.pending.push_back(payload);
    }

    /// Payloads queued but not yet packaged.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Package queued payloads within the in-flight budget and return the
    /// datagrams to transmit for the first time.
    pub fn flush(&mut self, max_in_flight: usize, now: Instant) -> Vec<Vec<u8>> {
        let budget = max_in_flight.saturating_sub(self.outbound.len());
        if budget > 0 && !self.pending.is_empty() {
            let packaged = self
                .packager
                .package(&mut self.pending, &mut self.tx_sequence, budget);
            self.tx_total += packaged.len() as u64;
            self.outbound.extend(packaged);
        }
        self.outbound.take_unsent(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments;

    fn session() -> Session {
        Session::new(
            "127.0.0.1:5000".parse().unwrap(),
            7,
            ClientServer::Login,
            496,
            Duration::from_millis(20),
            Instant::now(),
        )
    }

    fn data(byte: u8) -> Sequenced {
        Sequenced::Data(vec![vec![byte]])
    }

    #[test]
    fn test_in_order_delivery() {
        let mut s = session();
        let out = s.receive(0, data(1));
        assert_eq!(out.status, InboundStatus::Delivered);
        assert_eq!(out.deliveries, vec![vec![1]]);
        assert_eq!(out.acknowledge, Some(0));
        assert!(out.out_of_order.is_empty());
        assert_eq!(s.rx_sequence(), 1);
    }

    #[test]
    fn test_gap_reported_once_then_filled() {
        let mut s = session();
        let out = s.receive(2, data(3));
        assert_eq!(out.status, InboundStatus::Buffered);
        assert_eq!(out.out_of_order, vec![0, 1]);
        assert_eq!(out.acknowledge, None);

        let out = s.receive(3, data(4));
        assert!(out.out_of_order.is_empty(), "gap already reported");

        let out = s.receive(1, data(2));
        assert_eq!(out.status, InboundStatus::Buffered);
        assert!(out.out_of_order.is_empty());

        let out = s.receive(0, data(1));
        assert_eq!(out.deliveries, vec![vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(out.acknowledge, Some(3));
        assert_eq!(s.rx_sequence(), 4);
    }

    #[test]
    fn test_stale_packet_is_reacknowledged() {
        let mut s = session();
        s.receive(0, data(1));
        s.receive(1, data(2));
        let out = s.receive(0, data(1));
        assert_eq!(out.status, InboundStatus::Duplicate);
        assert!(out.deliveries.is_empty());
        assert_eq!(out.acknowledge, Some(1));
    }

    #[test]
    fn test_duplicate_buffered_packet_ignored() {
        let mut s = session();
        s.receive(5, data(6));
        let out = s.receive(5, data(6));
        assert_eq!(out.status, InboundStatus::Duplicate);
    }

    #[test]
    fn test_delivery_across_wraparound() {
        let mut s = session();
        s.rx_sequence = 65_534;
        let out = s.receive(0, data(3));
        assert_eq!(out.out_of_order, vec![65_534, 65_535]);
        s.receive(65_535, data(2));
        let out = s.receive(65_534, data(1));
        assert_eq!(out.deliveries, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(out.acknowledge, Some(0));
        assert_eq!(s.rx_sequence(), 1);
    }

    #[test]
    fn test_fragments_reassemble_out_of_order() {
        let mut s = session();
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let chunks = fragments::split(&payload, 489);
        assert_eq!(chunks.len(), 4);

        let order = [2usize, 0, 3, 1];
        let mut delivered = Vec::new();
        for &i in &order {
            let out = s.receive(i as u16, Sequenced::Fragment(chunks[i].clone()));
            delivered.extend(out.deliveries);
        }
        assert_eq!(delivered, vec![payload]);
    }

    #[test]
    fn test_malformed_fragment_is_dropped() {
        let mut s = session();
        let out = s.receive(0, Sequenced::Fragment(vec![0x00]));
        assert_eq!(out.status, InboundStatus::Delivered);
        assert!(out.deliveries.is_empty());
        assert_eq!(out.acknowledge, Some(0));
    }

    #[test]
    fn test_flush_assigns_sequences_and_counts() {
        let mut s = session();
        s.queue(vec![1; 10]);
        s.queue(vec![2; 2000]);
        let now = Instant::now();
        let sent = s.flush(4096, now);
        assert_eq!(sent.len() as u64, s.tx_total());
        assert!(sent.len() >= 5);
        assert_eq!(s.outbound().len(), sent.len());
        assert!(s.flush(4096, now).is_empty());
    }

    #[test]
    fn test_flush_respects_in_flight_budget() {
        let mut s = session();
        for _ in 0..4 {
            s.queue(vec![9; 400]);
        }
        let now = Instant::now();
        assert_eq!(s.flush(2, now).len(), 2);
        assert_eq!(s.pending_len(), 2);
        assert!(s.flush(2, now).is_empty(), "budget exhausted");
        s.outbound_mut().acknowledge(1, now);
        assert_eq!(s.flush(2, now).len(), 2);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn test_idle_detection() {
        let s = session();
        let later = Instant::now() + Duration::from_secs(31);
        assert!(s.is_idle(later, Duration::from_secs(30)));
        assert!(!s.is_idle(Instant::now(), Duration::from_secs(30)));
    }
}
