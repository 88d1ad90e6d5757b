//! In-flight payload rewrites and outbound routing.
//!
//! The forwarder only looks inside two messages: the client's login request,
//! which gets stored credentials filled in, and the backend's galaxy list,
//! which is pointed back at the local listeners. Everything else passes
//! through byte for byte.

use crate::messages::{self, HeartBeat, LoginClientId, LoginClusterStatus, SwgMessage};

/// Address galaxies are rewritten to.
pub const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Which client session an outbound payload belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Every live session.
    All,
    /// The login server session.
    Login,
    /// The zone server session.
    Zone,
    /// A ping echo; the contained bytes go raw to the ping listener's peer.
    Pong(Vec<u8>),
}

/// Route a backend payload to the session that should receive it.
pub fn classify(payload: &[u8]) -> Route {
    let Some(crc) = messages::message_crc(payload) else {
        return Route::Zone;
    };
    match crc {
        messages::ERROR_MESSAGE | messages::SERVER_ID | messages::SERVER_NOW_EPOCH_TIME => {
            Route::All
        }
        messages::LOGIN_CLUSTER_STATUS
        | messages::LOGIN_CLIENT_TOKEN
        | messages::LOGIN_INCORRECT_CLIENT_ID
        | messages::LOGIN_ENUM_CLUSTER
        | messages::ENUMERATE_CHARACTER_ID
        | messages::CHARACTER_CREATION_DISABLED
        | messages::DELETE_CHARACTER_REQUEST
        | messages::DELETE_CHARACTER_RESPONSE => Route::Login,
        messages::HEART_BEAT => match HeartBeat::decode(payload) {
            Ok(beat) if !beat.payload.is_empty() => Route::Pong(beat.payload),
            _ => Route::Zone,
        },
        _ => Route::Zone,
    }
}

/// Rewrites login traffic between the client and the backend.
#[derive(Debug, Clone)]
pub struct NetInterceptor {
    username: String,
    password: String,
    zone_port: u16,
    ping_port: u16,
}

impl NetInterceptor {
    /// `zone_port` and `ping_port` are the locally bound listener ports.
    pub fn new(username: String, password: String, zone_port: u16, ping_port: u16) -> Self {
        Self {
            username,
            password,
            zone_port,
            ping_port,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Rewrite a client-to-backend payload.
    ///
    /// A login with the stored username and an empty password gets the stored
    /// password. A login that carries its own password replaces the stored
    /// credentials.
    pub fn intercept_client(&mut self, payload: Vec<u8>) -> Vec<u8> {
        if messages::message_crc(&payload) != Some(messages::LOGIN_CLIENT_ID) {
            return payload;
        }
        let (mut login, trailer) = match LoginClientId::decode_with_trailer(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Passing through undecodable login request: {e}");
                return payload;
            }
        };

        if login.password.is_empty() {
            if login.username != self.username || self.password.is_empty() {
                return payload;
            }
            tracing::debug!("Filling in stored password for {}", login.username);
            login.password.clone_from(&self.password);
        } else {
            self.username.clone_from(&login.username);
            self.password.clone_from(&login.password);
        }
        login.encode_with_trailer(trailer)
    }

    /// Rewrite a backend-to-client payload.
    ///
    /// Galaxy addresses and ports in the cluster list are replaced with the
    /// local listeners so the client reconnects through the forwarder.
    pub fn intercept_server(&self, payload: Vec<u8>) -> Vec<u8> {
        if messages::message_crc(&payload) != Some(messages::LOGIN_CLUSTER_STATUS) {
            return payload;
        }
        let (mut cluster, trailer) = match LoginClusterStatus::decode_with_trailer(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Passing through undecodable cluster list: {e}");
                return payload;
            }
        };
        for galaxy in &mut cluster.galaxies {
            galaxy.address = LOCAL_ADDRESS.to_string();
            galaxy.zone_port = self.zone_port;
            galaxy.ping_port = self.ping_port;
        }
        cluster.encode_with_trailer(trailer)
    }
}
