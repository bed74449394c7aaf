//! Linear-backoff reconnection policy for the broker connection.
//!
//! The delay before a reconnect attempt drops back to zero when the last
//! session carried traffic (a message was published or consumed), and
//! otherwise grows by a fixed step up to a ceiling. The connector's
//! supervised loop applies this between attempts and stops for good once
//! `max_attempts` consecutive attempts have failed.

use std::time::Duration;

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Amount added to the delay after an idle session or failed attempt.
    pub step: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up, the first
    /// attempt included. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Calculate the next delay from the current one.
///
/// `had_activity` resets the delay to zero; otherwise it grows by
/// [`ReconnectConfig::step`], clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, had_activity: bool, config: &ReconnectConfig) -> Duration {
    if had_activity {
        return Duration::ZERO;
    }
    current.saturating_add(config.step).min(config.max_delay)
}

/// Whether `failures` consecutive failures exhaust the attempt budget.
pub fn attempts_exhausted(failures: u32, config: &ReconnectConfig) -> bool {
    config.max_attempts.is_some_and(|max| failures >= max)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
