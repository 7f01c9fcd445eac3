//! Reconnect delay policy.
//!
//! The default is a fixed delay between attempts. Exponential growth and
//! jitter can be switched on for clients that should back off harder when the
//! server stays down.

use crate::config::ProtocolConfig;
use rand::Rng;
use std::time::Duration;

/// How long a reconnecting client waits before each attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt after a drop.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Growth factor per failed attempt. `1.0` keeps the delay fixed.
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(ProtocolConfig::RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Same delay before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    /// Doubling delay starting at `base_delay`, capped at the default maximum.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: ProtocolConfig::MAX_RECONNECT_DELAY.max(base_delay),
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.exponential_base.max(1.0).powi(exponent);
        let max_secs = self.max_delay.max(self.base_delay).as_secs_f64();
        let capped_secs = (self.base_delay.as_secs_f64() * multiplier).min(max_secs);

        let final_secs = if self.jitter {
            // Scale by 0.5..1.5 so the mean stays put without near-zero delays.
            let factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * factor).min(max_secs)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}
