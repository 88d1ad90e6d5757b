//! SOE to Holocore forwarder: the bridge between a game client speaking SOE
//! over UDP and a Holocore server speaking framed SWG messages over TCP.

pub mod bridge;
pub mod events;

pub use bridge::{Bridge, BridgeConfig};
pub use events::{BridgeEvent, EventBus};
