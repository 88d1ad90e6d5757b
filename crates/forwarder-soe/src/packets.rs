//! SOE wire packets: decode table, encoding, and decode errors.
//!
//! Every control packet begins with a big-endian `u16` opcode. A datagram
//! whose first byte is non-zero is an unframed application payload and is
//! surfaced as [`SoePacket::Raw`].
//!
//! ```text
//! +---------------+------------------------------+
//! | opcode (u16)  |  body (opcode specific, BE)  |
//! +---------------+------------------------------+
//! ```

use std::fmt;

/// Marker that follows the sequence of a data channel carrying more than one
/// payload.
pub const MULTI_PAYLOAD_MARKER: u16 = 0x0019;

const OP_SESSION_REQUEST: u16 = 0x01;
const OP_SESSION_RESPONSE: u16 = 0x02;
const OP_MULTI_PACKET: u16 = 0x03;
const OP_DISCONNECT: u16 = 0x05;
const OP_KEEP_ALIVE: u16 = 0x06;
const OP_CLIENT_NETWORK_STATUS: u16 = 0x07;
const OP_SERVER_NETWORK_STATUS: u16 = 0x08;
const OP_DATA_CHANNEL: u16 = 0x09;
const OP_FRAGMENTED: u16 = 0x0D;
const OP_OUT_OF_ORDER: u16 = 0x11;
const OP_ACKNOWLEDGE: u16 = 0x15;

/// Errors produced while decoding SOE packets or reassembling fragments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer than two bytes: no opcode present.
    #[error("datagram of {0} bytes is too short to carry an opcode")]
    TooShort(usize),

    /// The body ended before every field of the packet was read.
    #[error("{kind} truncated: needed {needed} bytes, had {actual}")]
    Truncated {
        /// Packet kind being decoded.
        kind: &'static str,
        /// Bytes required to finish the field being read.
        needed: usize,
        /// Bytes remaining in the body.
        actual: usize,
    },

    /// The opcode is not part of the decode table.
    #[error("unknown opcode 0x{0:04X}")]
    UnknownOpcode(u16),

    /// The first fragment of a message did not carry its 4-byte length.
    #[error("first fragment is {0} bytes, shorter than the length header")]
    FragmentHeader(usize),

    /// More fragment bytes arrived than the first fragment declared.
    #[error("fragments overflowed: declared {declared} bytes, received {received}")]
    FragmentOverflow {
        /// Length declared by the first fragment.
        declared: usize,
        /// Bytes accumulated so far.
        received: usize,
    },
}

// ---------------------------------------------------------------------------
// Channel / DisconnectReason
// ---------------------------------------------------------------------------

/// One of the four SOE data channels. The bridge only originates traffic on
/// [`Channel::A`], but echoes whichever channel the client used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
    C,
    D,
}

impl Channel {
    fn from_offset(offset: u16) -> Self {
        match offset {
            0 => Channel::A,
            1 => Channel::B,
            2 => Channel::C,
            _ => Channel::D,
        }
    }

    fn offset(self) -> u16 {
        match self {
            Channel::A => 0,
            Channel::B => 1,
            Channel::C => 2,
            Channel::D => 3,
        }
    }
}

/// Reason code carried by a [`SoePacket::Disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    None,
    IcmpError,
    Timeout,
    OtherSideTerminated,
    ManagerDeleted,
    ConnectFail,
    Application,
    UnreachableConnection,
    UnacknowledgedTimeout,
    NewConnectionAttempt,
    ConnectionRefused,
    MutualConnectionError,
    ConnectingToSelf,
    ReliableOverflow,
    /// A code outside the known table, kept as sent.
    Other(u16),
}

impl DisconnectReason {
    /// Map a wire value to a reason. Unknown values are kept in
    /// [`DisconnectReason::Other`].
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::IcmpError,
            2 => Self::Timeout,
            3 => Self::OtherSideTerminated,
            4 => Self::ManagerDeleted,
            5 => Self::ConnectFail,
            6 => Self::Application,
            7 => Self::UnreachableConnection,
            8 => Self::UnacknowledgedTimeout,
            9 => Self::NewConnectionAttempt,
            10 => Self::ConnectionRefused,
            11 => Self::MutualConnectionError,
            12 => Self::ConnectingToSelf,
            13 => Self::ReliableOverflow,
            0 => Self::None,
            other => Self::Other(other),
        }
    }

    /// Wire value of this reason.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::IcmpError => 1,
            Self::Timeout => 2,
            Self::OtherSideTerminated => 3,
            Self::ManagerDeleted => 4,
            Self::ConnectFail => 5,
            Self::Application => 6,
            Self::UnreachableConnection => 7,
            Self::UnacknowledgedTimeout => 8,
            Self::NewConnectionAttempt => 9,
            Self::ConnectionRefused => 10,
            Self::MutualConnectionError => 11,
            Self::ConnectingToSelf => 12,
            Self::ReliableOverflow => 13,
            Self::Other(value) => value,
        }
    }
}

// ---------------------------------------------------------------------------
// Network status bodies
// ---------------------------------------------------------------------------

/// Body of a client network status update (opcode 0x07).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientNetworkStatus {
    pub tick: u16,
    pub last_update: u32,
    pub average_update: u32,
    pub shortest_update: u32,
    pub longest_update: u32,
    pub last_server_update: u32,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// Body of a server network status update (opcode 0x08).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerNetworkStatus {
    pub client_tick: u16,
    /// Milliseconds since 2011-12-05 00:00 UTC, truncated to 32 bits.
    pub server_sync_stamp: u32,
    pub client_packets_sent: u64,
    pub client_packets_received: u64,
    pub server_packets_sent: u64,
    pub server_packets_received: u64,
}

// ---------------------------------------------------------------------------
// SoePacket
// ---------------------------------------------------------------------------

/// A decoded SOE datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoePacket {
    SessionRequest {
        crc_length: u32,
        connection_id: u32,
        udp_size: u32,
    },
    SessionResponse {
        connection_id: u32,
        crc_seed: u32,
        crc_length: u8,
        encryption_flag: u8,
        xor_length: u8,
        udp_size: u32,
    },
    /// Several complete SOE packets bundled into one datagram.
    MultiPacket(Vec<Vec<u8>>),
    Disconnect {
        connection_id: u32,
        reason: DisconnectReason,
    },
    KeepAlive,
    ClientNetworkStatus(ClientNetworkStatus),
    ServerNetworkStatus(ServerNetworkStatus),
    /// Reliable, sequenced application payloads.
    DataChannel {
        channel: Channel,
        sequence: u16,
        payloads: Vec<Vec<u8>>,
    },
    /// One chunk of a payload too large for a single data channel.
    Fragmented {
        channel: Channel,
        sequence: u16,
        chunk: Vec<u8>,
    },
    OutOfOrder {
        channel: Channel,
        sequence: u16,
    },
    Acknowledge {
        channel: Channel,
        sequence: u16,
    },
    /// Unframed application payload (first byte non-zero).
    Raw(Vec<u8>),
}

impl SoePacket {
    /// Decode one datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::TooShort(bytes.len()));
        }
        if bytes[0] != 0 {
            return Ok(SoePacket::Raw(bytes.to_vec()));
        }

        let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut r = Reader::new(&bytes[2..]);
        let packet = match opcode {
            OP_SESSION_REQUEST => {
                r.kind = "SessionRequest";
                SoePacket::SessionRequest {
                    crc_length: r.u32()?,
                    connection_id: r.u32()?,
                    udp_size: r.u32()?,
                }
            }
            OP_SESSION_RESPONSE => {
                r.kind = "SessionResponse";
                SoePacket::SessionResponse {
                    connection_id: r.u32()?,
                    crc_seed: r.u32()?,
                    crc_length: r.u8()?,
                    encryption_flag: r.u8()?,
                    xor_length: r.u8()?,
                    udp_size: r.u32()?,
                }
            }
            OP_MULTI_PACKET => {
                r.kind = "MultiPacket";
                SoePacket::MultiPacket(read_sub_packets(&mut r, Endian::Little)?)
            }
            OP_DISCONNECT => {
                r.kind = "Disconnect";
                SoePacket::Disconnect {
                    connection_id: r.u32()?,
                    reason: DisconnectReason::from_u16(r.u16()?),
                }
            }
            OP_KEEP_ALIVE => SoePacket::KeepAlive,
            OP_CLIENT_NETWORK_STATUS => {
                r.kind = "ClientNetworkStatus";
                SoePacket::ClientNetworkStatus(ClientNetworkStatus {
                    tick: r.u16()?,
                    last_update: r.u32()?,
                    average_update: r.u32()?,
                    shortest_update: r.u32()?,
                    longest_update: r.u32()?,
                    last_server_update: r.u32()?,
                    packets_sent: r.u64()?,
                    packets_received: r.u64()?,
                })
            }
            OP_SERVER_NETWORK_STATUS => {
                r.kind = "ServerNetworkStatus";
                SoePacket::ServerNetworkStatus(ServerNetworkStatus {
                    client_tick: r.u16()?,
                    server_sync_stamp: r.u32()?,
                    client_packets_sent: r.u64()?,
                    client_packets_received: r.u64()?,
                    server_packets_sent: r.u64()?,
                    server_packets_received: r.u64()?,
                })
            }
            op @ OP_DATA_CHANNEL..OP_FRAGMENTED => {
                r.kind = "DataChannel";
                let channel = Channel::from_offset(op - OP_DATA_CHANNEL);
                let sequence = r.u16()?;
                let payloads = if r.peek_u16() == Some(MULTI_PAYLOAD_MARKER) {
                    r.u16()?;
                    read_sub_packets(&mut r, Endian::Big)?
                } else {
                    vec![r.rest().to_vec()]
                };
                SoePacket::DataChannel {
                    channel,
                    sequence,
                    payloads,
                }
            }
            op @ OP_FRAGMENTED..OP_OUT_OF_ORDER => {
                r.kind = "Fragmented";
                SoePacket::Fragmented {
                    channel: Channel::from_offset(op - OP_FRAGMENTED),
                    sequence: r.u16()?,
                    chunk: r.rest().to_vec(),
                }
            }
            op @ OP_OUT_OF_ORDER..OP_ACKNOWLEDGE => {
                r.kind = "OutOfOrder";
                SoePacket::OutOfOrder {
                    channel: Channel::from_offset(op - OP_OUT_OF_ORDER),
                    sequence: r.u16()?,
                }
            }
            op @ OP_ACKNOWLEDGE..=0x18 => {
                r.kind = "Acknowledge";
                SoePacket::Acknowledge {
                    channel: Channel::from_offset(op - OP_ACKNOWLEDGE),
                    sequence: r.u16()?,
                }
            }
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(packet)
    }

    /// Encode this packet into a new datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        match self {
            SoePacket::SessionRequest {
                crc_length,
                connection_id,
                udp_size,
            } => {
                out.extend_from_slice(&OP_SESSION_REQUEST.to_be_bytes());
                out.extend_from_slice(&crc_length.to_be_bytes());
                out.extend_from_slice(&connection_id.to_be_bytes());
                out.extend_from_slice(&udp_size.to_be_bytes());
            }
            SoePacket::SessionResponse {
                connection_id,
                crc_seed,
                crc_length,
                encryption_flag,
                xor_length,
                udp_size,
            } => {
                out.extend_from_slice(&OP_SESSION_RESPONSE.to_be_bytes());
                out.extend_from_slice(&connection_id.to_be_bytes());
                out.extend_from_slice(&crc_seed.to_be_bytes());
                out.push(*crc_length);
                out.push(*encryption_flag);
                out.push(*xor_length);
                out.extend_from_slice(&udp_size.to_be_bytes());
            }
            SoePacket::MultiPacket(children) => {
                out.extend_from_slice(&OP_MULTI_PACKET.to_be_bytes());
                write_sub_packets(&mut out, children, Endian::Little);
            }
            SoePacket::Disconnect {
                connection_id,
                reason,
            } => {
                out.extend_from_slice(&OP_DISCONNECT.to_be_bytes());
                out.extend_from_slice(&connection_id.to_be_bytes());
                out.extend_from_slice(&reason.as_u16().to_be_bytes());
            }
            SoePacket::KeepAlive => out.extend_from_slice(&OP_KEEP_ALIVE.to_be_bytes()),
            SoePacket::ClientNetworkStatus(s) => {
                out.extend_from_slice(&OP_CLIENT_NETWORK_STATUS.to_be_bytes());
                out.extend_from_slice(&s.tick.to_be_bytes());
                out.extend_from_slice(&s.last_update.to_be_bytes());
                out.extend_from_slice(&s.average_update.to_be_bytes());
                out.extend_from_slice(&s.shortest_update.to_be_bytes());
                out.extend_from_slice(&s.longest_update.to_be_bytes());
                out.extend_from_slice(&s.last_server_update.to_be_bytes());
                out.extend_from_slice(&s.packets_sent.to_be_bytes());
                out.extend_from_slice(&s.packets_received.to_be_bytes());
            }
            SoePacket::ServerNetworkStatus(s) => {
                out.extend_from_slice(&OP_SERVER_NETWORK_STATUS.to_be_bytes());
                out.extend_from_slice(&s.client_tick.to_be_bytes());
                out.extend_from_slice(&s.server_sync_stamp.to_be_bytes());
                out.extend_from_slice(&s.client_packets_sent.to_be_bytes());
                out.extend_from_slice(&s.client_packets_received.to_be_bytes());
                out.extend_from_slice(&s.server_packets_sent.to_be_bytes());
                out.extend_from_slice(&s.server_packets_received.to_be_bytes());
            }
            SoePacket::DataChannel {
                channel,
                sequence,
                payloads,
            } => {
                out.extend_from_slice(&(OP_DATA_CHANNEL + channel.offset()).to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                if let Some(single) = inline_payload(payloads) {
                    out.extend_from_slice(single);
                } else {
                    out.extend_from_slice(&MULTI_PAYLOAD_MARKER.to_be_bytes());
                    write_sub_packets(&mut out, payloads, Endian::Big);
                }
            }
            SoePacket::Fragmented {
                channel,
                sequence,
                chunk,
            } => {
                out.extend_from_slice(&(OP_FRAGMENTED + channel.offset()).to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(chunk);
            }
            SoePacket::OutOfOrder { channel, sequence } => {
                out.extend_from_slice(&(OP_OUT_OF_ORDER + channel.offset()).to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
            }
            SoePacket::Acknowledge { channel, sequence } => {
                out.extend_from_slice(&(OP_ACKNOWLEDGE + channel.offset()).to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
            }
            SoePacket::Raw(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    /// Exact size of [`SoePacket::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        match self {
            SoePacket::SessionRequest { .. } => 14,
            SoePacket::SessionResponse { .. } => 17,
            SoePacket::MultiPacket(children) => 2 + sub_packets_len(children),
            SoePacket::Disconnect { .. } => 8,
            SoePacket::KeepAlive => 2,
            SoePacket::ClientNetworkStatus(_) | SoePacket::ServerNetworkStatus(_) => 40,
            SoePacket::DataChannel { payloads, .. } => match inline_payload(payloads) {
                Some(single) => 4 + single.len(),
                None => 6 + sub_packets_len(payloads),
            },
            SoePacket::Fragmented { chunk, .. } => 4 + chunk.len(),
            SoePacket::OutOfOrder { .. } | SoePacket::Acknowledge { .. } => 4,
            SoePacket::Raw(bytes) => bytes.len(),
        }
    }
}

/// The lone payload of a data channel that can go out without the multi
/// marker. A payload that itself starts with the marker bytes cannot.
fn inline_payload(payloads: &[Vec<u8>]) -> Option<&Vec<u8>> {
    match payloads {
        [single] if !single.starts_with(&MULTI_PAYLOAD_MARKER.to_be_bytes()) => Some(single),
        _ => None,
    }
}

impl fmt::Display for SoePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoePacket::SessionRequest { connection_id, .. } => {
                write!(f, "SessionRequest[id={connection_id}]")
            }
            SoePacket::SessionResponse { connection_id, .. } => {
                write!(f, "SessionResponse[id={connection_id}]")
            }
            SoePacket::MultiPacket(children) => write!(f, "MultiPacket[packets={}]", children.len()),
            SoePacket::Disconnect {
                connection_id,
                reason,
            } => write!(f, "Disconnect[id={connection_id}, reason={reason:?}]"),
            SoePacket::KeepAlive => write!(f, "KeepAlive"),
            SoePacket::ClientNetworkStatus(s) => write!(f, "ClientNetworkStatus[tick={}]", s.tick),
            SoePacket::ServerNetworkStatus(s) => {
                write!(f, "ServerNetworkStatus[tick={}]", s.client_tick)
            }
            SoePacket::DataChannel {
                sequence, payloads, ..
            } => write!(f, "DataChannel[seq={sequence}, packets={}]", payloads.len()),
            SoePacket::Fragmented {
                sequence, chunk, ..
            } => write!(f, "Fragmented[seq={sequence}, len={}]", chunk.len()),
            SoePacket::OutOfOrder { sequence, .. } => write!(f, "OutOfOrder[seq={sequence}]"),
            SoePacket::Acknowledge { sequence, .. } => write!(f, "Acknowledge[seq={sequence}]"),
            SoePacket::Raw(bytes) => write!(f, "Raw[len={}]", bytes.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-packet framing
// ---------------------------------------------------------------------------

/// Byte order of the 16-bit extended length inside a sub-packet list.
#[derive(Clone, Copy)]
enum Endian {
    Big,
    Little,
}

/// Bytes a sub-packet of `len` bytes occupies, including its length prefix.
pub fn sub_packet_cost(len: usize) -> usize {
    if len >= 0xFF { len + 3 } else { len + 1 }
}

fn sub_packets_len(children: &[Vec<u8>]) -> usize {
    children.iter().map(|c| sub_packet_cost(c.len())).sum()
}

fn write_sub_packets(out: &mut Vec<u8>, children: &[Vec<u8>], endian: Endian) {
    for child in children {
        let len = child.len();
        if len >= 0xFF {
            out.push(0xFF);
            let len = len as u16;
            match endian {
                Endian::Big => out.extend_from_slice(&len.to_be_bytes()),
                Endian::Little => out.extend_from_slice(&len.to_le_bytes()),
            }
        } else {
            out.push(len as u8);
        }
        out.extend_from_slice(child);
    }
}

fn read_sub_packets(r: &mut Reader<'_>, endian: Endian) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut children = Vec::new();
    while r.remaining() > 0 {
        let mut len = r.u8()? as usize;
        if len == 0xFF {
            let extended = match endian {
                Endian::Big => r.u16()?,
                Endian::Little => u16::from_le_bytes(r.array()?),
            };
            len = extended as usize;
        }
        children.push(r.take(len)?.to_vec());
    }
    Ok(children)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Big-endian cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            kind: "packet",
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                kind: self.kind,
                needed: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn peek_u16(&self) -> Option<u16> {
        self.buf
            .get(self.pos..self.pos + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(bytes: &[u8]) -> Vec<u8> {
        SoePacket::decode(bytes).unwrap().encode()
    }

    #[test]
    fn test_session_request_layout() {
        let bytes = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x01, 0xF0,
        ];
        let packet = SoePacket::decode(&bytes).unwrap();
        assert_eq!(
            packet,
            SoePacket::SessionRequest {
                crc_length: 2,
                connection_id: 7,
                udp_size: 496,
            }
        );
        assert_eq!(packet.encode(), bytes);
    }

    #[test]
    fn test_session_response_is_seventeen_bytes() {
        let packet = SoePacket::SessionResponse {
            connection_id: 7,
            crc_seed: 0,
            crc_length: 0,
            encryption_flag: 0,
            xor_length: 0,
            udp_size: 496,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..2], &[0x00, 0x02]);
        assert_eq!(&bytes[13..], &496u32.to_be_bytes());
        assert_eq!(SoePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_control_packets_reencode_identically() {
        let samples: Vec<Vec<u8>> = vec![
            vec![0x00, 0x05, 0x00, 0x00, 0x00, 0x07, 0x00, 0x06],
            vec![0x00, 0x06],
            vec![0x00, 0x11, 0x12, 0x34],
            vec![0x00, 0x16, 0xFF, 0xFE],
            vec![0x00, 0x0D, 0x00, 0x01, 0xDE, 0xAD],
            vec![0x00, 0x09, 0x00, 0x03, 0x01, 0x00, 0xAA],
            vec![0x00, 0x09, 0x00, 0x04, 0x00, 0x19, 0x02, 0x01, 0x02, 0x01, 0x03],
            vec![0x00, 0x03, 0x02, 0x00, 0x06, 0x04, 0x00, 0x15, 0x00, 0x01],
            vec![0x05, 0x00, 0x11, 0x22],
        ];
        for bytes in samples {
            assert_eq!(reencode(&bytes), bytes, "re-encode mismatch for {bytes:02X?}");
        }
    }

    #[test]
    fn test_network_status_reencode_identically() {
        let mut client = vec![0x00, 0x07];
        client.extend((0..38).map(|i| i as u8));
        assert_eq!(reencode(&client), client);

        let mut server = vec![0x00, 0x08];
        server.extend((0..38).map(|i| 0xFF - i as u8));
        assert_eq!(reencode(&server), server);
    }

    #[test]
    fn test_data_channel_multi_payload_decodes() {
        let bytes = [0x00, 0x0A, 0x00, 0x04, 0x00, 0x19, 0x02, 0x01, 0x02, 0x01, 0x03];
        let packet = SoePacket::decode(&bytes).unwrap();
        assert_eq!(
            packet,
            SoePacket::DataChannel {
                channel: Channel::B,
                sequence: 4,
                payloads: vec![vec![0x01, 0x02], vec![0x03]],
            }
        );
    }

    #[test]
    fn test_long_sub_packet_uses_extended_length() {
        let big = vec![0x42u8; 300];
        let packet = SoePacket::DataChannel {
            channel: Channel::A,
            sequence: 1,
            payloads: vec![big.clone(), vec![1]],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(bytes[6], 0xFF);
        assert_eq!(&bytes[7..9], &300u16.to_be_bytes());
        assert_eq!(SoePacket::decode(&bytes).unwrap(), packet);

        let multi = SoePacket::MultiPacket(vec![big]);
        let bytes = multi.encode();
        assert_eq!(&bytes[3..5], &300u16.to_le_bytes());
        assert_eq!(SoePacket::decode(&bytes).unwrap(), multi);
    }

    #[test]
    fn test_first_byte_nonzero_is_raw() {
        let bytes = [0x04, 0x00, 0x01, 0x02];
        assert_eq!(
            SoePacket::decode(&bytes).unwrap(),
            SoePacket::Raw(bytes.to_vec())
        );
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert_eq!(SoePacket::decode(&[]), Err(DecodeError::TooShort(0)));
        assert_eq!(SoePacket::decode(&[0x00]), Err(DecodeError::TooShort(1)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let result = SoePacket::decode(&[0x00, 0x01, 0x00, 0x00]);
        assert!(matches!(
            result,
            Err(DecodeError::Truncated {
                kind: "SessionRequest",
                ..
            })
        ));
        assert!(SoePacket::decode(&[0x00, 0x15, 0x01]).is_err());
    }

    #[test]
    fn test_truncated_sub_packet_rejected() {
        let result = SoePacket::decode(&[0x00, 0x03, 0x05, 0x01, 0x02]);
        assert!(matches!(result, Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert_eq!(
            SoePacket::decode(&[0x00, 0x04]),
            Err(DecodeError::UnknownOpcode(4))
        );
        assert_eq!(
            SoePacket::decode(&[0x00, 0x20, 0x00]),
            Err(DecodeError::UnknownOpcode(0x20))
        );
    }

    #[test]
    fn test_unknown_disconnect_reason_survives_reencode() {
        let bytes = [0x00, 0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x63];
        let packet = SoePacket::decode(&bytes).unwrap();
        match packet {
            SoePacket::Disconnect { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Other(0x63));
            }
            ref other => panic!("unexpected {other}"),
        }
        assert_eq!(packet.encode(), bytes);
        assert_eq!(DisconnectReason::from_u16(0), DisconnectReason::None);
    }

    #[test]
    fn test_single_payload_starting_with_marker_keeps_marker() {
        let packet = SoePacket::DataChannel {
            channel: Channel::A,
            sequence: 0,
            payloads: vec![vec![0x00, 0x19, 0x01, 0x02, 0x03, 0x04]],
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[4..6], &[0x00, 0x19]);
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(SoePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_single_plain_payload_is_inline() {
        let packet = SoePacket::DataChannel {
            channel: Channel::A,
            sequence: 3,
            payloads: vec![vec![0x02, 0x00, 0x96, 0x1F, 0x13, 0x41]],
        };
        let bytes = packet.encode();
        assert_eq!(bytes, [0x00, 0x09, 0x00, 0x03, 0x02, 0x00, 0x96, 0x1F, 0x13, 0x41]);
        assert_eq!(SoePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_channel_opcodes() {
        for (op, channel) in [(0x15, Channel::A), (0x16, Channel::B), (0x17, Channel::C), (0x18, Channel::D)] {
            let packet = SoePacket::decode(&[0x00, op, 0x00, 0x09]).unwrap();
            assert_eq!(
                packet,
                SoePacket::Acknowledge {
                    channel,
                    sequence: 9
                }
            );
        }
    }
}
