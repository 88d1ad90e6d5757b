//! Configuration error types.

use std::path::PathBuf;

/// Failure to load or store `config.ron`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a valid forwarder config.
    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[source] ron::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_names_the_file() {
        let source = ron::from_str::<crate::ForwarderConfig>("(network: (zone_port: \"x\"))")
            .unwrap_err();
        let err = ConfigError::Parse {
            path: PathBuf::from("/tmp/soe-forwarder/config.ron"),
            source,
        };
        let message = err.to_string();
        assert!(message.starts_with("invalid config in /tmp/soe-forwarder/config.ron"));
    }
}
