//! Restart backoff for failed servers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toolport_core::{ToolportError, ToolportResult};

/// Automatic restart policy: exponential delay with jitter, bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first restart attempt.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Upper bound for the un-jittered delay.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Restart attempts before a manual retry is required.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Extra random delay, as a fraction of the computed delay (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    1_000
}
fn default_max_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub(crate) fn validate(&self) -> ToolportResult<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ToolportError::Config(format!(
                "backoff.jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.max_ms < self.base_ms {
            return Err(ToolportError::Config(
                "backoff.max_ms must not be below backoff.base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before restart attempt `attempt` (1-based), without jitter:
    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(30);
        let candidate = self.base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(candidate.min(self.max_ms))
    }

    /// Delay before restart attempt `attempt` with random jitter added.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.mul_f64(self.jitter);
        let extra = rand::thread_rng().gen_range(0.0..=1.0);
        base + spread.mul_f64(extra)
    }

    /// Whether another automatic attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
