use std::time::Duration;

use anyhow::{Context, Result};

/// Tuning for [`ReconnectSupervisor`](crate::ReconnectSupervisor) and the
/// WebSocket feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay unit for exponential backoff (`base * 2^attempt`).
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Consecutive failures after which the supervisor gives up.
    pub max_attempts: u32,
    /// Bound on each connect/handshake step of a feed subscription.
    pub open_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 5,
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Defaults overridden by `STREAK_RECONNECT_BASE_MS`,
    /// `STREAK_RECONNECT_MAX_MS`, `STREAK_RECONNECT_MAX_ATTEMPTS` and
    /// `STREAK_FEED_TIMEOUT_MS` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_u64("STREAK_RECONNECT_BASE_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("STREAK_RECONNECT_MAX_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("STREAK_RECONNECT_MAX_ATTEMPTS")? {
            config.max_attempts = u32::try_from(n).context("STREAK_RECONNECT_MAX_ATTEMPTS out of range")?;
        }
        if let Some(ms) = env_u64("STREAK_FEED_TIMEOUT_MS")? {
            config.open_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// Delay before the retry that follows the `attempt`-th consecutive
    /// failure: `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => Ok(Some(
            raw.parse()
                .with_context(|| format!("{} must be an integer, got '{}'", name, raw))?,
        )),
        Err(_) => Ok(None),
    }
}
