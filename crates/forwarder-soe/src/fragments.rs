//! Fragment splitting and reassembly.
//!
//! A payload too large for one data channel travels as a run of `Fragmented`
//! chunks. The first chunk starts with the payload's total length as a
//! big-endian `u32`; later chunks are payload bytes only.

use crate::packets::DecodeError;

const LENGTH_HEADER: usize = 4;

/// Split `payload` into chunks of at most `chunk_size` bytes, the first of
/// which carries the length header.
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let chunk_size = chunk_size.max(LENGTH_HEADER + 1);
    let mut prefixed = Vec::with_capacity(LENGTH_HEADER + payload.len());
    prefixed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    prefixed.extend_from_slice(payload);
    prefixed.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

/// Accumulates in-order fragment chunks until a whole payload is present.
#[derive(Debug, Default)]
pub struct FragmentReassembler {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl FragmentReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    ///
    /// Returns `Ok(Some(payload))` once the declared length is reached,
    /// `Ok(None)` while more chunks are needed. On error the partial payload
    /// is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
        let expected = match self.expected {
            Some(expected) => {
                self.buffer.extend_from_slice(chunk);
                expected
            }
            None => {
                if chunk.len() < LENGTH_HEADER {
                    return Err(DecodeError::FragmentHeader(chunk.len()));
                }
                let expected =
                    u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                self.expected = Some(expected);
                self.buffer.extend_from_slice(&chunk[LENGTH_HEADER..]);
                expected
            }
        };

        if self.buffer.len() > expected {
            let received = self.buffer.len();
            self.reset();
            return Err(DecodeError::FragmentOverflow {
                declared: expected,
                received,
            });
        }
        if self.buffer.len() < expected {
            return Ok(None);
        }

        self.expected = None;
        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    /// `true` while a partial payload is buffered.
    pub fn is_pending(&self) -> bool {
        self.expected.is_some()
    }

    /// Drop any partial payload.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }
}
