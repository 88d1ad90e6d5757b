//! Command-line argument parsing for the forwarder.

use std::path::PathBuf;

use clap::Parser;

use crate::ForwarderConfig;

/// SOE to Holocore forwarder.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "soe-forwarder", about = "Bridges an SOE game client to a Holocore server")]
pub struct CliArgs {
    /// Login server listener port.
    #[arg(long)]
    pub login_port: Option<u16>,

    /// Zone server listener port.
    #[arg(long)]
    pub zone_port: Option<u16>,

    /// Ping server listener port.
    #[arg(long)]
    pub ping_port: Option<u16>,

    /// Holocore address.
    #[arg(long)]
    pub backend: Option<String>,

    /// Holocore port.
    #[arg(long)]
    pub backend_port: Option<u16>,

    /// Username whose password is filled in automatically.
    #[arg(long)]
    pub username: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for JSON log files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ForwarderConfig {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.login_port {
            self.network.login_port = port;
        }
        if let Some(port) = args.zone_port {
            self.network.zone_port = port;
        }
        if let Some(port) = args.ping_port {
            self.network.ping_port = port;
        }
        if let Some(ref addr) = args.backend {
            self.network.backend_address = addr.clone();
        }
        if let Some(port) = args.backend_port {
            self.network.backend_port = port;
        }
        if let Some(ref username) = args.username {
            self.credentials.username = username.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(ref dir) = args.log_dir {
            self.debug.log_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = ForwarderConfig::default();
        let args = CliArgs {
            zone_port: Some(0),
            backend: Some("192.168.1.1".to_string()),
            username: Some("luke".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.zone_port, 0);
        assert_eq!(config.network.backend_address, "192.168.1.1");
        assert_eq!(config.credentials.username, "luke");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.login_port, 44453);
        assert_eq!(config.network.backend_port, 44455);
    }

    #[test]
    fn test_cli_no_override() {
        let original = ForwarderConfig::default();
        let mut config = ForwarderConfig::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "soe-forwarder",
            "--backend",
            "play.example.org",
            "--backend-port",
            "44463",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.backend.as_deref(), Some("play.example.org"));
        assert_eq!(args.backend_port, Some(44463));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }
}
