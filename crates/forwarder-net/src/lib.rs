//! Backend side of the forwarder: stream framing, SWG message codecs, the
//! login interceptor, and the Holocore TCP client.

pub mod compression;
pub mod framing;
pub mod holocore;
pub mod interceptor;
pub mod messages;
pub mod reconnection;

pub use framing::{FrameBuffer, FrameConfig, FrameError};
pub use holocore::{ConnectionState, ConnectionStateWatch, HolocoreClient, HolocoreConfig, HolocoreError};
pub use interceptor::{NetInterceptor, Route};
pub use messages::{ConnectionStoppedReason, SwgMessage};
pub use reconnection::{ReconnectConfig, ReconnectError, ReconnectState};
