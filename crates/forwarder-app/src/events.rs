//! Status bus for observers outside the data path, such as a GUI.

use std::net::SocketAddr;

use forwarder_soe::{ClientServer, DisconnectReason};
use tokio::sync::broadcast;

/// Events retained for slow subscribers before they start lagging.
const EVENT_CAPACITY: usize = 256;

/// Something observable happened in the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The client logged in on the login server.
    ClientConnected,
    /// The last client session ended.
    ClientDisconnected,
    SessionCreated {
        server: ClientServer,
        connection_id: u32,
        source: SocketAddr,
    },
    SessionDestroyed {
        server: ClientServer,
        connection_id: u32,
        reason: DisconnectReason,
    },
    BackendConnecting {
        address: String,
    },
    BackendConnected {
        address: SocketAddr,
    },
    BackendDisconnected,
    /// Connecting gave up; the client has to retry.
    BackendFailed {
        reason: String,
    },
}

/// Fan-out of [`BridgeEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`. Nobody listening is fine.
    pub fn publish(&self, event: BridgeEvent) {
        tracing::debug!("Bridge event: {event:?}");
        let _ = self.tx.send(event);
    }
}
