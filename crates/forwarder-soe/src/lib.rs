//! SOE reliable-UDP transport: packet codec, sequencing, fragmentation,
//! packaging, congestion-controlled retransmission, and the session engine.

pub mod congestion;
pub mod engine;
pub mod fragments;
pub mod outbound;
pub mod packager;
pub mod packets;
pub mod sequence;
pub mod session;
pub mod udp;

pub use congestion::CongestionController;
pub use engine::{EngineConfig, EngineEvent, EngineOutput, SoeEngine, Transmit};
pub use fragments::FragmentReassembler;
pub use outbound::OutboundBuffer;
pub use packager::{DEFAULT_MTU, Packager};
pub use packets::{Channel, DecodeError, DisconnectReason, SoePacket};
pub use session::{ClientServer, InboundStatus, Session, SessionState};
pub use udp::{Datagram, UdpConfig, UdpListeners};
