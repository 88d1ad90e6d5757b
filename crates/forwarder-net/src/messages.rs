//! The SWG application payloads the forwarder has to look inside.
//!
//! Every payload starts with a little-endian `u16` operand count and a `u32`
//! type tag, the CRC of the message name (see [`swg_crc`]). Strings are a
//! `u16` length followed by ASCII bytes. Everything else is passed through
//! opaque, so only the handful of messages below have codecs.

use std::fmt;

/// Protocol version announced to the backend during the handshake.
pub const HOLOCORE_PROTOCOL: &str = "2016-04-13";

/// Bytes needed to read the operand count and type tag.
pub const HEADER_LEN: usize = 6;

/// CRC-32 (polynomial `0x04C11DB7`, MSB first) of a message name.
pub const fn swg_crc(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut crc: u32 = 0xFFFF_FFFF;
    let mut i = 0;
    while i < bytes.len() {
        crc ^= (bytes[i] as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        i += 1;
    }
    !crc
}

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

pub const LOGIN_CLIENT_ID: u32 = swg_crc("LoginClientId");
pub const LOGIN_CLUSTER_STATUS: u32 = swg_crc("LoginClusterStatus");
pub const LOGIN_CLIENT_TOKEN: u32 = swg_crc("LoginClientToken");
pub const LOGIN_INCORRECT_CLIENT_ID: u32 = swg_crc("LoginIncorrectClientId");
pub const LOGIN_ENUM_CLUSTER: u32 = swg_crc("LoginEnumCluster");
pub const ENUMERATE_CHARACTER_ID: u32 = swg_crc("EnumerateCharacterId");
pub const CHARACTER_CREATION_DISABLED: u32 = swg_crc("CharacterCreationDisabled");
pub const DELETE_CHARACTER_REQUEST: u32 = swg_crc("DeleteCharacterMessage");
pub const DELETE_CHARACTER_RESPONSE: u32 = swg_crc("DeleteCharacterReplyMessage");
pub const ERROR_MESSAGE: u32 = swg_crc("ErrorMessage");
/// Fixed by the client; does not match the CRC of its name.
pub const SERVER_ID: u32 = 0x58C0_7F21;
pub const SERVER_NOW_EPOCH_TIME: u32 = swg_crc("ServerNowEpochTime");
pub const HEART_BEAT: u32 = swg_crc("HeartBeat");
pub const HOLO_SET_PROTOCOL_VERSION: u32 = swg_crc("HoloSetProtocolVersion");
pub const HOLO_CONNECTION_STARTED: u32 = swg_crc("HoloConnectionStarted");
pub const HOLO_CONNECTION_STOPPED: u32 = swg_crc("HoloConnectionStopped");

/// Type tag of `payload`, if it is long enough to carry one.
pub fn message_crc(payload: &[u8]) -> Option<u32> {
    let tag = payload.get(2..HEADER_LEN)?;
    Some(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from decoding an SWG payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    /// The payload ended before a field could be read.
    #[error("{message} truncated: needed {needed} bytes at offset {offset}, {actual} total")]
    Truncated {
        message: &'static str,
        offset: usize,
        needed: usize,
        actual: usize,
    },
    /// The payload carries a different type tag.
    #[error("expected {message} (0x{expected:08X}), found 0x{actual:08X}")]
    WrongType {
        message: &'static str,
        expected: u32,
        actual: u32,
    },
    /// A string field is not valid text.
    #[error("{message} contains a non-ASCII string")]
    InvalidString { message: &'static str },
}

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

/// Little-endian field reader over one payload.
pub struct SwgReader<'a> {
    message: &'static str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SwgReader<'a> {
    fn new(message: &'static str, bytes: &'a [u8]) -> Self {
        Self {
            message,
            bytes,
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        let end = self.pos + n;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(MessageError::Truncated {
                message: self.message,
                offset: self.pos,
                needed: n,
                actual: self.bytes.len(),
            })?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, MessageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, MessageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, MessageError> {
        Ok(self.u32()? as i32)
    }

    pub fn ascii(&mut self) -> Result<String, MessageError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        if !bytes.is_ascii() {
            return Err(MessageError::InvalidString {
                message: self.message,
            });
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    /// Bytes left to read.
    pub fn rest_len(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }
}

/// Little-endian field writer.
#[derive(Default)]
pub struct SwgWriter {
    bytes: Vec<u8>,
}

impl SwgWriter {
    pub fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a length-prefixed string. Non-ASCII characters become `?`.
    pub fn ascii(&mut self, s: &str) {
        let len = s.chars().count().min(u16::MAX as usize);
        self.u16(len as u16);
        self.bytes
            .extend(s.chars().take(len).map(|c| if c.is_ascii() { c as u8 } else { b'?' }));
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }
}

// ---------------------------------------------------------------------------
// Message trait
// ---------------------------------------------------------------------------

/// An SWG payload with a fixed operand count and type tag.
pub trait SwgMessage: Sized {
    /// Message name, hashed into the type tag.
    const NAME: &'static str;
    const CRC: u32;
    const OPERANDS: u16;

    fn encode_fields(&self, w: &mut SwgWriter);
    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError>;

    fn encode(&self) -> Vec<u8> {
        self.encode_with_trailer(&[])
    }

    /// Encode, then append `trailer` unchanged.
    fn encode_with_trailer(&self, trailer: &[u8]) -> Vec<u8> {
        let mut w = SwgWriter::default();
        w.u16(Self::OPERANDS);
        w.u32(Self::CRC);
        self.encode_fields(&mut w);
        w.raw(trailer);
        w.bytes
    }

    fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        Self::decode_with_trailer(payload).map(|(message, _)| message)
    }

    /// Decode, also returning any bytes past the last known field.
    fn decode_with_trailer(payload: &[u8]) -> Result<(Self, &[u8]), MessageError> {
        let mut r = SwgReader::new(Self::NAME, payload);
        let _operands = r.u16()?;
        let crc = r.u32()?;
        if crc != Self::CRC {
            return Err(MessageError::WrongType {
                message: Self::NAME,
                expected: Self::CRC,
                actual: crc,
            });
        }
        let message = Self::decode_fields(&mut r)?;
        Ok((message, r.rest()))
    }
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// Client login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginClientId {
    pub username: String,
    pub password: String,
    pub version: String,
}

impl SwgMessage for LoginClientId {
    const NAME: &'static str = "LoginClientId";
    const CRC: u32 = LOGIN_CLIENT_ID;
    const OPERANDS: u16 = 4;

    fn encode_fields(&self, w: &mut SwgWriter) {
        w.ascii(&self.username);
        w.ascii(&self.password);
        w.ascii(&self.version);
    }

    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            username: r.ascii()?,
            password: r.ascii()?,
            version: r.ascii()?,
        })
    }
}

/// One galaxy entry in the cluster list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Galaxy {
    pub id: u32,
    pub address: String,
    pub zone_port: u16,
    pub ping_port: u16,
    pub population: i32,
    pub population_status: u32,
    pub max_characters: u32,
    pub distance: u32,
    pub status: u32,
    pub recommended: bool,
    pub online_player_limit: u32,
    pub online_free_trial_limit: u32,
}

/// Galaxy list the backend sends after a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginClusterStatus {
    pub galaxies: Vec<Galaxy>,
}

impl SwgMessage for LoginClusterStatus {
    const NAME: &'static str = "LoginClusterStatus";
    const CRC: u32 = LOGIN_CLUSTER_STATUS;
    const OPERANDS: u16 = 2;

    fn encode_fields(&self, w: &mut SwgWriter) {
        w.u32(self.galaxies.len() as u32);
        for g in &self.galaxies {
            w.u32(g.id);
            w.ascii(&g.address);
            w.u16(g.zone_port);
            w.u16(g.ping_port);
            w.i32(g.population);
            w.u32(g.population_status);
            w.u32(g.max_characters);
            w.u32(g.distance);
            w.u32(g.status);
            w.u8(u8::from(g.recommended));
            w.u32(g.online_player_limit);
            w.u32(g.online_free_trial_limit);
        }
    }

    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        let count = r.u32()?;
        // Each entry is at least 39 bytes, so a hostile count cannot force a
        // huge allocation.
        let mut galaxies = Vec::with_capacity((count as usize).min(64));
        for _ in 0..count {
            galaxies.push(Galaxy {
                id: r.u32()?,
                address: r.ascii()?,
                zone_port: r.u16()?,
                ping_port: r.u16()?,
                population: r.i32()?,
                population_status: r.u32()?,
                max_characters: r.u32()?,
                distance: r.u32()?,
                status: r.u32()?,
                recommended: r.u8()? != 0,
                online_player_limit: r.u32()?,
                online_free_trial_limit: r.u32()?,
            });
        }
        Ok(Self { galaxies })
    }
}

// ---------------------------------------------------------------------------
// Heartbeat and backend control
// ---------------------------------------------------------------------------

/// Keepalive. With a payload it is a ping-server echo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub payload: Vec<u8>,
}

impl SwgMessage for HeartBeat {
    const NAME: &'static str = "HeartBeat";
    const CRC: u32 = HEART_BEAT;
    const OPERANDS: u16 = 1;

    fn encode_fields(&self, w: &mut SwgWriter) {
        w.raw(&self.payload);
    }

    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            payload: r.rest().to_vec(),
        })
    }
}

/// First message on a backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoloSetProtocolVersion {
    pub protocol: String,
}

impl Default for HoloSetProtocolVersion {
    fn default() -> Self {
        Self {
            protocol: HOLOCORE_PROTOCOL.to_string(),
        }
    }
}

impl SwgMessage for HoloSetProtocolVersion {
    const NAME: &'static str = "HoloSetProtocolVersion";
    const CRC: u32 = HOLO_SET_PROTOCOL_VERSION;
    const OPERANDS: u16 = 2;

    fn encode_fields(&self, w: &mut SwgWriter) {
        w.ascii(&self.protocol);
    }

    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            protocol: r.ascii()?,
        })
    }
}

/// Handshake acknowledgement, sent by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoloConnectionStarted;

impl SwgMessage for HoloConnectionStarted {
    const NAME: &'static str = "HoloConnectionStarted";
    const CRC: u32 = HOLO_CONNECTION_STARTED;
    const OPERANDS: u16 = 1;

    fn encode_fields(&self, _w: &mut SwgWriter) {}

    fn decode_fields(_r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        Ok(Self)
    }
}

/// Why a backend connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStoppedReason {
    None,
    OtherSideTerminated,
    InvalidProtocol,
    Application,
    NewConnection,
    Crash,
    #[default]
    Unknown,
}

impl ConnectionStoppedReason {
    /// Wire name of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::OtherSideTerminated => "OTHER_SIDE_TERMINATED",
            Self::InvalidProtocol => "INVALID_PROTOCOL",
            Self::Application => "APPLICATION",
            Self::NewConnection => "NEW_CONNECTION",
            Self::Crash => "CRASH",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire name; anything unrecognised is [`Self::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "NONE" => Self::None,
            "OTHER_SIDE_TERMINATED" => Self::OtherSideTerminated,
            "INVALID_PROTOCOL" => Self::InvalidProtocol,
            "APPLICATION" => Self::Application,
            "NEW_CONNECTION" => Self::NewConnection,
            "CRASH" => Self::Crash,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ConnectionStoppedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orderly end of a backend connection, sent by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoloConnectionStopped {
    pub reason: ConnectionStoppedReason,
}

impl HoloConnectionStopped {
    pub fn new(reason: ConnectionStoppedReason) -> Self {
        Self { reason }
    }
}

impl SwgMessage for HoloConnectionStopped {
    const NAME: &'static str = "HoloConnectionStopped";
    const CRC: u32 = HOLO_CONNECTION_STOPPED;
    const OPERANDS: u16 = 2;

    fn encode_fields(&self, w: &mut SwgWriter) {
        w.ascii(self.reason.as_str());
    }

    fn decode_fields(r: &mut SwgReader<'_>) -> Result<Self, MessageError> {
        // Older servers send the bare message.
        let reason = if r.rest_len() >= 2 {
            ConnectionStoppedReason::from_name(&r.ascii()?)
        } else {
            ConnectionStoppedReason::Unknown
        };
        Ok(Self { reason })
    }
}
