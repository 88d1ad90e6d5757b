//! Configuration structs with sensible defaults and RON persistence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Default config directory: `<platform config dir>/soe-forwarder`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("soe-forwarder")
}

/// Top-level forwarder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Listener ports and backend address.
    pub network: NetworkConfig,
    /// Reliable-UDP tuning.
    pub transport: TransportConfig,
    /// Login credentials filled in for the client.
    pub credentials: CredentialsConfig,
    /// Logging settings.
    pub debug: DebugConfig,
}

/// Listener ports and backend address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Login server listener port (0 = OS-assigned).
    pub login_port: u16,
    /// Zone server listener port (0 = OS-assigned).
    pub zone_port: u16,
    /// Ping server listener port (0 = OS-assigned).
    pub ping_port: u16,
    /// Holocore host name or IP.
    pub backend_address: String,
    /// Holocore TCP port.
    pub backend_port: u16,
    /// Backend connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Client session idle timeout in seconds.
    pub session_timeout_seconds: u64,
}

/// Reliable-UDP and backend keepalive tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum SOE packet size in bytes.
    pub mtu: u16,
    /// Unacknowledged packets allowed before packaging pauses.
    pub max_in_flight: usize,
    /// Initial retransmission interval in milliseconds.
    pub resend_interval_ms: u64,
    /// Backend heartbeat interval in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Backend silence, in seconds, before the link is declared dead.
    pub heartbeat_timeout_seconds: u64,
}

/// Stored login credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            login_port: 44453,
            zone_port: 44463,
            ping_port: 44462,
            backend_address: "127.0.0.1".to_string(),
            backend_port: 44455,
            connect_timeout_ms: 5000,
            session_timeout_seconds: 30,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: 496,
            max_in_flight: 4096,
            resend_interval_ms: 20,
            heartbeat_interval_seconds: 10,
            heartbeat_timeout_seconds: 21,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }
}

impl TransportConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }
}

// --- Load / Save / Reload ---

fn read_config(path: &Path) -> Result<ForwarderConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Where a loaded config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from an existing file.
    Loaded(PathBuf),
    /// A default file was written here.
    Created(PathBuf),
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOrigin::Loaded(path) => write!(f, "Loaded config from {}", path.display()),
            ConfigOrigin::Created(path) => write!(f, "Created default config at {}", path.display()),
        }
    }
}

impl ForwarderConfig {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let (config, origin) = Self::open(config_dir)?;
        log::info!("{origin}");
        Ok(config)
    }

    /// Same as [`load_or_create`](Self::load_or_create) without logging, for
    /// callers that read the config before a logger exists.
    pub fn open(config_dir: &Path) -> Result<(Self, ConfigOrigin), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = read_config(&config_path)?;
            Ok((config, ConfigOrigin::Loaded(config_path)))
        } else {
            let config = ForwarderConfig::default();
            config.save(config_dir)?;
            Ok((config, ConfigOrigin::Created(config_path)))
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let new_config = read_config(&config_path)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Persist new credentials, leaving the rest of the file as it is on disk.
    ///
    /// Settings overridden on the command line for this run are not written.
    pub fn store_credentials(
        config_dir: &Path,
        username: &str,
        password: &str,
    ) -> Result<(), ConfigError> {
        let mut on_disk = Self::load_or_create(config_dir)?;
        if on_disk.credentials.username == username && on_disk.credentials.password == password {
            return Ok(());
        }
        on_disk.credentials = CredentialsConfig {
            username: username.to_string(),
            password: password.to_string(),
        };
        on_disk.save(config_dir)?;
        log::info!("Saved credentials for {username}");
        Ok(())
    }
}
