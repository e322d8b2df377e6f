//! Bridge reconnection with exponential backoff.
//!
//! Both TCP bridges (the link and the reader) reconnect the same way: wait,
//! try, double the wait, up to a fixed number of attempts. Exhaustion is
//! returned to the caller, which decides whether the generation ends.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{defaults, LinkConfig, ReaderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    /// Delay before the first attempt. Doubles each attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Call `connect` until it succeeds or the attempts run out.
    pub async fn run<T, E, F, Fut>(&self, peer: &str, mut connect: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            let delay = self.delay_for(attempt);
            warn!(
                peer,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                "[Reconnect] Bridge lost, reconnecting"
            );
            tokio::time::sleep(delay).await;

            match connect().await {
                Ok(value) => {
                    info!(peer, attempt, "[Reconnect] Bridge reconnected");
                    return Ok(value);
                }
                Err(e) if attempt >= attempts => {
                    error!(peer, max_attempts = attempts, "[Reconnect] Reconnection exhausted: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!(peer, attempt, "[Reconnect] Attempt failed: {e}");
                }
            }
            attempt += 1;
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for ReconnectPolicy {
    fn from(config: &LinkConfig) -> Self {
        Self {
            attempts: config.reconnect_attempts.max(1),
            initial_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(defaults::MAX_RECONNECT_DELAY_MS),
        }
    }
}

impl From<&ReaderConfig> for ReconnectPolicy {
    fn from(config: &ReaderConfig) -> Self {
        Self {
            attempts: config.reconnect_attempts.max(1),
            initial_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(defaults::MAX_RECONNECT_DELAY_MS),
        }
    }
}
