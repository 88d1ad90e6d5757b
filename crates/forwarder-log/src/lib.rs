//! Structured logging for the forwarder.
//!
//! Console output with uptime stamps and module paths, plus an optional JSON
//! log file for post-mortem analysis of a session. `RUST_LOG` wins over the
//! configured level so a single run can be traced without editing the config.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use forwarder_config::ForwarderConfig;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "forwarder.log";

/// Filter directives for `config`, falling back to [`DEFAULT_FILTER`].
pub fn filter_directives(config: Option<&ForwarderConfig>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// Create the log directory if needed and truncate the log file in it.
pub fn open_log_file(log_dir: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    File::create(log_dir.join(LOG_FILE_NAME))
}

/// JSON lines layer writing to `file`.
pub fn json_file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}

/// Install the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `json_file` - whether to write the JSON log at all
/// * `config` - supplies the log level when `RUST_LOG` is unset
///
/// A log directory that cannot be created only costs the file output; the
/// console layer is still installed. Fails if a global subscriber is
/// already set.
pub fn init_logging(
    log_dir: Option<&Path>,
    json_file: bool,
    config: Option<&ForwarderConfig>,
) -> Result<(), TryInitError> {
    let filter_str = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if json_file && let Some(log_dir) = log_dir {
        match open_log_file(log_dir) {
            Ok(file) => return subscriber.with(json_file_layer(file)).try_init(),
            Err(e) => eprintln!("Could not open log file in {}: {e}", log_dir.display()),
        }
    }

    subscriber.try_init()
}
