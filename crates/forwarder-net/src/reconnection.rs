//! Backend reconnection with exponential backoff.
//!
//! While a client waits for the backend, [`ReconnectState`] computes
//! exponentially increasing delays with jitter and [`connect_with_backoff`]
//! drives the actual connection attempts.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::holocore::{HolocoreClient, HolocoreConfig, HolocoreError};

/// Configuration for reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts. Default: 30 s.
    pub max_delay: Duration,
    /// Attempts before giving up. Default: 20.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0), applied as ±jitter to the delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

/// Tracks the attempt count and computes the next backoff delay.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Errors produced while reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// All configured attempts failed.
    #[error("gave up after {0} attempts")]
    MaxAttemptsExhausted(u32),
    /// The backend will never accept us; retrying is pointless.
    #[error("backend rejected the protocol version")]
    ProtocolMismatch,
    /// Shutdown was signalled while waiting.
    #[error("reconnection cancelled")]
    Cancelled,
}

/// Connect to the backend, retrying with backoff until it answers.
///
/// The first attempt is immediate. A protocol mismatch ends the loop at
/// once, and so does `shutdown` turning `true`.
pub async fn connect_with_backoff(
    addr: SocketAddr,
    config: &HolocoreConfig,
    reconnect: ReconnectConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(HolocoreClient, mpsc::UnboundedReceiver<Vec<u8>>), ReconnectError> {
    let mut state = ReconnectState::new(reconnect);
    loop {
        if *shutdown.borrow() {
            return Err(ReconnectError::Cancelled);
        }
        tracing::debug!("Connecting to backend at {addr}");
        match HolocoreClient::connect(addr, config.clone()).await {
            Ok(connected) => {
                if state.attempts() > 0 {
                    tracing::info!("Reached backend after {} retries", state.attempts());
                }
                return Ok(connected);
            }
            Err(HolocoreError::ProtocolMismatch) => return Err(ReconnectError::ProtocolMismatch),
            Err(e) => tracing::warn!("Backend connection attempt failed: {e}"),
        }

        let Some(delay) = state.next_delay() else {
            return Err(ReconnectError::MaxAttemptsExhausted(state.attempts()));
        };
        tracing::info!("Retrying backend connection in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(ReconnectError::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config_no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_sequence_is_exponential() {
        let mut state = ReconnectState::new(config_no_jitter());
        let delays: Vec<Duration> = (0..4).map(|_| state.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_max_backoff_is_capped() {
        let mut state = ReconnectState::new(config_no_jitter());
        let last = (0..15).filter_map(|_| state.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn test_max_attempts_exhausted() {
        let mut state = ReconnectState::new(ReconnectConfig {
            max_attempts: 3,
            jitter: 0.0,
            ..Default::default()
        });
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut state = ReconnectState::new(config_no_jitter());
        state.next_delay();
        state.next_delay();
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..50 {
            let mut state = ReconnectState::new(ReconnectConfig::default());
            let delay = state.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_tx, mut shutdown) = watch::channel(false);
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_attempts: 2,
            jitter: 0.0,
            ..Default::default()
        };
        let result = connect_with_backoff(addr, &HolocoreConfig::default(), reconnect, &mut shutdown).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsExhausted(2))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut shutdown) = watch::channel(false);
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_secs(30),
            jitter: 0.0,
            ..Default::default()
        };
        let task = tokio::spawn(async move {
            connect_with_backoff(addr, &HolocoreConfig::default(), reconnect, &mut shutdown).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReconnectError::Cancelled)));
    }
}
