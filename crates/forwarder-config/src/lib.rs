//! Forwarder configuration.
//!
//! Settings persist to disk as a RON file, load with per-section defaults so
//! old files keep working, and can be overridden from the command line.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ConfigOrigin, CredentialsConfig, DebugConfig, ForwarderConfig, NetworkConfig, TransportConfig,
    default_config_dir,
};
pub use error::ConfigError;
