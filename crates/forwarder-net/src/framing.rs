//! Length-prefixed, optionally compressed framing for the backend stream.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! +---------+------------------+------------------+-----------------+
//! | flags   | body length      | original length  |  body           |
//! | 1 byte  | u16 little-endian| u16 little-endian|  (body length)  |
//! +---------+------------------+------------------+-----------------+
//! ```
//!
//! Flag bit 0 marks an LZ4-compressed body, bit 1 marks an SWG payload (the
//! forwarder always sets it). The original length is the payload size before
//! compression and equals the body length when bit 0 is clear.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::compression::{self, CompressionConfig, CompressionError};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;
/// Flag bit: body is an LZ4 block.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Flag bit: body is an SWG payload.
pub const FLAG_SWG: u8 = 0x02;

/// Capacity the receive buffer returns to once drained.
const DEFAULT_BUFFER_CAPACITY: usize = 4096;
/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 4096;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. The header can express at most 65535.
    pub max_payload_size: usize,
    /// When to compress outgoing payloads.
    pub compression: CompressionConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: u16::MAX as usize,
            compression: CompressionConfig::default(),
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// A compressed body could not be inflated.
    #[error("bad compressed body: {0}")]
    Decompress(#[from] CompressionError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build one frame around `payload`, compressing it when that helps.
pub fn assemble(payload: &[u8], config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    let max = config.max_payload_size.min(u16::MAX as usize);
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }

    let compressed = compression::compress(payload, &config.compression);
    let (flags, body) = match &compressed {
        Some(body) => (FLAG_SWG | FLAG_COMPRESSED, body.as_slice()),
        None => (FLAG_SWG, payload),
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(flags);
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy)]
struct Header {
    flags: u8,
    body_len: usize,
    original_len: usize,
}

fn peek_header(bytes: &[u8]) -> Option<Header> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    Some(Header {
        flags: bytes[0],
        body_len: u16::from_le_bytes([bytes[1], bytes[2]]) as usize,
        original_len: u16::from_le_bytes([bytes[3], bytes[4]]) as usize,
    })
}

/// Accumulates stream bytes and hands out whole frames.
///
/// After [`disassemble`](Self::disassemble) the buffer only ever holds the
/// leading bytes of a frame that has not fully arrived yet.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(DEFAULT_BUFFER_CAPACITY),
        }
    }

    /// Append `data` and report whether a complete frame is now buffered.
    pub fn add_to_buffer(&mut self, data: &[u8]) -> bool {
        self.bytes.extend_from_slice(data);
        self.has_frame()
    }

    /// Whether a complete frame is buffered.
    pub fn has_frame(&self) -> bool {
        peek_header(&self.bytes).is_some_and(|h| self.bytes.len() >= HEADER_LEN + h.body_len)
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current allocation of the receive buffer.
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Take the next complete frame's payload.
    ///
    /// Returns `None` and leaves the buffer untouched while the frame is
    /// incomplete. A frame whose body fails to decompress is still consumed,
    /// so the stream stays aligned on the following frame.
    pub fn disassemble(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        let header = peek_header(&self.bytes)?;
        let end = HEADER_LEN + header.body_len;
        if self.bytes.len() < end {
            return None;
        }

        let result = {
            let body = &self.bytes[HEADER_LEN..end];
            if header.flags & FLAG_COMPRESSED != 0 {
                compression::decompress(body, header.original_len).map_err(FrameError::from)
            } else {
                Ok(body.to_vec())
            }
        };

        self.bytes.drain(..end);
        if self.bytes.is_empty() && self.bytes.capacity() > DEFAULT_BUFFER_CAPACITY {
            self.bytes.shrink_to(DEFAULT_BUFFER_CAPACITY);
        }
        Some(result)
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.bytes.shrink_to(DEFAULT_BUFFER_CAPACITY);
    }
}

/// Read one frame's payload from the stream, buffering partial reads.
///
/// Bytes past the end of the returned frame stay in `buffer` for the next
/// call. Returns [`FrameError::ConnectionClosed`] if the peer closes the
/// stream first.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
) -> Result<Vec<u8>, FrameError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(result) = buffer.disassemble() {
            return result;
        }
        let n = match reader.read(&mut chunk).await {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::ConnectionClosed);
            }
            Err(e) => return Err(FrameError::Io(e)),
        };
        buffer.add_to_buffer(&chunk[..n]);
    }
}

/// Frame `payload` and write it to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let frame = assemble(payload, config)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
