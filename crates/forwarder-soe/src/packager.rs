//! Outbound packaging: coalesce small payloads into data channels, split
//! large ones into fragments, and stamp each wire packet with a tx sequence.

use std::collections::VecDeque;

use crate::fragments;
use crate::packets::{Channel, SoePacket, sub_packet_cost};

/// Framing overhead counted against a data channel before any payload.
const CHANNEL_OVERHEAD: usize = 8;

/// Opcode and sequence in front of every fragment chunk.
const FRAGMENT_OVERHEAD: usize = 4;

/// Largest SOE datagram the client negotiates.
pub const DEFAULT_MTU: usize = 496;

/// A packaged packet waiting to enter the outbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packaged {
    pub sequence: u16,
    pub bytes: Vec<u8>,
}

/// MTU-bounded packager.
#[derive(Debug, Clone)]
pub struct Packager {
    mtu: usize,
}

impl Default for Packager {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

impl Packager {
    /// Create a packager for the given MTU.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: mtu.max(CHANNEL_OVERHEAD + 8),
        }
    }

    /// Largest fragment chunk that still fits in one datagram.
    pub fn fragment_size(&self) -> usize {
        self.mtu - FRAGMENT_OVERHEAD - 3
    }

    /// Drain payloads from `queue` into wire packets.
    ///
    /// At most `max_packets` packets are produced; payloads that would exceed
    /// the budget stay queued. `next_sequence` is advanced once per packet.
    pub fn package(
        &self,
        queue: &mut VecDeque<Vec<u8>>,
        next_sequence: &mut u16,
        max_packets: usize,
    ) -> Vec<Packaged> {
        let mut out = Vec::new();
        let mut channel: Vec<Vec<u8>> = Vec::new();
        let mut size = CHANNEL_OVERHEAD;

        while let Some(payload) = queue.pop_front() {
            let cost = sub_packet_cost(payload.len());
            let pending = usize::from(!channel.is_empty());

            if CHANNEL_OVERHEAD + cost >= self.mtu {
                let needed = (payload.len() + 4).div_ceil(self.fragment_size());
                if out.len() + pending + needed > max_packets {
                    queue.push_front(payload);
                    break;
                }
                Self::flush(&mut out, &mut channel, &mut size, next_sequence);
                for chunk in fragments::split(&payload, self.fragment_size()) {
                    let packet = SoePacket::Fragmented {
                        channel: Channel::A,
                        sequence: *next_sequence,
                        chunk,
                    };
                    out.push(Packaged {
                        sequence: *next_sequence,
                        bytes: packet.encode(),
                    });
                    *next_sequence = next_sequence.wrapping_add(1);
                }
                continue;
            }

            if size + cost >= self.mtu {
                if out.len() + 2 > max_packets {
                    queue.push_front(payload);
                    break;
                }
                Self::flush(&mut out, &mut channel, &mut size, next_sequence);
            } else if out.len() + 1 > max_packets {
                queue.push_front(payload);
                break;
            }
            size += cost;
            channel.push(payload);
        }

        Self::flush(&mut out, &mut channel, &mut size, next_sequence);
        out
    }

    fn flush(
        out: &mut Vec<Packaged>,
        channel: &mut Vec<Vec<u8>>,
        size: &mut usize,
        next_sequence: &mut u16,
    ) {
        if channel.is_empty() {
            return;
        }
        let packet = SoePacket::DataChannel {
            channel: Channel::A,
            sequence: *next_sequence,
            payloads: std::mem::take(channel),
        };
        out.push(Packaged {
            sequence: *next_sequence,
            bytes: packet.encode(),
        });
        *next_sequence = next_sequence.wrapping_add(1);
        *size = CHANNEL_OVERHEAD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::FragmentReassembler;

    fn queue_of(sizes: &[usize]) -> VecDeque<Vec<u8>> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| vec![(i as u8).wrapping_add(1); len])
            .collect()
    }

    fn payloads_of(packaged: &[Packaged]) -> VecDeque<Vec<u8>> {
        let mut reassembler = FragmentReassembler::new();
        let mut out = Vec::new();
        for p in packaged {
            match SoePacket::decode(&p.bytes).unwrap() {
                SoePacket::DataChannel { payloads, .. } => out.extend(payloads),
                SoePacket::Fragmented { chunk, .. } => {
                    if let Some(payload) = reassembler.push(&chunk).unwrap() {
                        out.push(payload);
                    }
                }
                other => panic!("unexpected {other}"),
            }
        }
        out.into()
    }

    #[test]
    fn test_small_payloads_share_one_channel() {
        let packager = Packager::default();
        let mut queue = queue_of(&[10, 20, 30]);
        let mut seq = 0;
        let out = packager.package(&mut queue, &mut seq, 4096);
        assert_eq!(out.len(), 1);
        assert_eq!(seq, 1);
        assert!(queue.is_empty());
        assert_eq!(payloads_of(&out), queue_of(&[10, 20, 30]));
    }

    #[test]
    fn test_channel_flushes_before_mtu() {
        let packager = Packager::default();
        let sizes = [200, 200, 200, 100];
        let mut queue = queue_of(&sizes);
        let mut seq = 10;
        let out = packager.package(&mut queue, &mut seq, 4096);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence, 10);
        assert_eq!(out[1].sequence, 11);
        assert!(out.iter().all(|p| p.bytes.len() <= DEFAULT_MTU));
        assert_eq!(payloads_of(&out), queue_of(&sizes));
    }

    #[test]
    fn test_large_payload_is_fragmented() {
        let packager = Packager::default();
        let mut queue = queue_of(&[3000]);
        let mut seq = 0;
        let out = packager.package(&mut queue, &mut seq, 4096);
        assert!(out.len() >= 2);
        assert!(out.iter().all(|p| p.bytes.len() <= DEFAULT_MTU));
        let delivered = payloads_of(&out);
        assert_eq!(delivered, queue_of(&[3000]));
        assert_eq!(
            delivered.iter().map(Vec::len).sum::<usize>(),
            3000,
            "bytes out should equal bytes in"
        );
    }

    #[test]
    fn test_mixed_sizes_preserve_order() {
        let packager = Packager::default();
        let sizes = [5, 600, 40, 255, 1200, 1];
        let mut queue = queue_of(&sizes);
        let mut seq = 65_534;
        let out = packager.package(&mut queue, &mut seq, 4096);
        assert!(out.iter().all(|p| p.bytes.len() <= DEFAULT_MTU));
        assert_eq!(out[0].sequence, 65_534);
        assert_eq!(out[2].sequence, 0, "sequence wraps");
        assert_eq!(payloads_of(&out), queue_of(&sizes));
    }

    #[test]
    fn test_budget_leaves_remaining_payloads_queued() {
        let packager = Packager::default();
        let mut queue = queue_of(&[400, 400, 400, 400]);
        let mut seq = 0;
        let out = packager.package(&mut queue, &mut seq, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(queue.len(), 2);

        let rest = packager.package(&mut queue, &mut seq, 4096);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].sequence, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fragment_size_fits_mtu() {
        let packager = Packager::default();
        assert_eq!(packager.fragment_size(), 489);
    }
}
