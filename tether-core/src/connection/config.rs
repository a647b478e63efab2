//! Tunables for [`ReliableConnection`](super::ReliableConnection).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long to wait between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay after every attempt.
    Fixed { interval_ms: u64 },
    /// Doubles after every attempt, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed { interval_ms: 8000 }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `attempt`-th dial (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            Self::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Configuration for one reliable connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay between retransmissions of the in-flight reliable message.
    pub retransmit_interval_ms: u64,
    /// Dial attempts per reconnection sequence.
    pub retry_limit: u32,
    /// Spacing of those attempts.
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retransmit_interval_ms: 10,
            retry_limit: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}
