use std::time::Duration;

use serde::Deserialize;

/// Request queue configuration, deserializable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum wall-clock spacing between the start of two dispatched
    /// upstream calls, in seconds. A strict gap, not a token bucket: the
    /// worker sleeps out the remainder before every dispatch.
    pub rate_limit_seconds: f64,
    /// How long the worker parks waiting for a new request before rechecking
    /// whether it should still be alive.
    pub idle_timeout_ms: u64,
    /// Capacity of the pending-request channel.
    pub submit_channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate_limit_seconds: 1.0,
            idle_timeout_ms: 100,
            submit_channel_capacity: 1024,
        }
    }
}

impl QueueConfig {
    pub(crate) fn rate_limit(&self) -> Duration {
        // NaN and negative values are clamped to zero (no spacing).
        Duration::from_secs_f64(self.rate_limit_seconds.max(0.0))
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
