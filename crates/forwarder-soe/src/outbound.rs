//! Unacknowledged outbound packets and their retransmission.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::congestion::CongestionController;
use crate::packager::Packaged;
use crate::sequence;

/// A packaged packet the peer has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct OutboundEntry {
    pub sequence: u16,
    pub bytes: Vec<u8>,
    pub sent: bool,
    pub last_sent: Option<Instant>,
}

/// Ordered buffer of unacknowledged packets plus the congestion state that
/// decides how many are resent per cycle.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    entries: VecDeque<OutboundEntry>,
    congestion: CongestionController,
}

impl OutboundBuffer {
    /// Create an empty buffer using `resend_interval` until RTT is known.
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            congestion: CongestionController::new(resend_interval),
        }
    }

    /// Number of unacknowledged packets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    /// Append freshly packaged packets.
    pub fn extend(&mut self, packaged: impl IntoIterator<Item = Packaged>) {
        self.entries
            .extend(packaged.into_iter().map(|p| OutboundEntry {
                sequence: p.sequence,
                bytes: p.bytes,
                sent: false,
                last_sent: None,
            }));
    }

    /// Transmit every packet that has never been sent.
    pub fn take_unsent(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| !e.sent) {
            entry.sent = true;
            entry.last_sent = Some(now);
            self.congestion.on_send(now);
            out.push(entry.bytes.clone());
        }
        out
    }

    /// Clear every packet up to and including `sequence`. Returns how many
    /// were cleared.
    pub fn acknowledge(&mut self, sequence: u16, now: Instant) -> usize {
        self.congestion.on_acknowledge(now);
        let mut cleared = 0;
        while let Some(front) = self.entries.front() {
            if sequence::compare(front.sequence, sequence) == Ordering::Greater {
                break;
            }
            self.entries.pop_front();
            cleared += 1;
        }
        cleared
    }

    /// Handle an out-of-order notice: returns the bytes to fast-resend if the
    /// named packet is still buffered.
    pub fn out_of_order(&mut self, sequence: u16, now: Instant) -> Option<Vec<u8>> {
        self.congestion.on_out_of_order(now);
        let entry = self.entries.iter_mut().find(|e| e.sequence == sequence)?;
        entry.sent = true;
        entry.last_sent = Some(now);
        Some(entry.bytes.clone())
    }

    /// Run one resend cycle: resize the window and return the oldest
    /// `window` packets for retransmission.
    pub fn resend_cycle(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let window = self.congestion.begin_cycle(self.entries.len());
        let mut out = Vec::with_capacity(window.min(self.entries.len()));
        for entry in self.entries.iter_mut().take(window) {
            entry.sent = true;
            entry.last_sent = Some(now);
            self.congestion.on_send(now);
            out.push(entry.bytes.clone());
        }
        out
    }

    /// Delay until the next resend cycle.
    pub fn resend_delay(&self) -> Duration {
        self.congestion.resend_delay()
    }
}
