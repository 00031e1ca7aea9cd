//! # Adaptive Round Timeouts
//!
//! A fixed consensus timeout is wrong twice: too long on a fast LAN (rounds
//! with a dead proposer waste seconds), too short across continents (healthy
//! rounds time out). The policy scales with what the network monitor
//! measures:
//!
//! ```text
//!   t0      = clamp(base + k * avg_latency, min, max)     avg == 0 -> base
//!   t(r)    = min(t0 + t0 * r * increment_pct / 100, max)
//! ```
//!
//! The round term guarantees that, after GST, timeouts eventually exceed the
//! real message delay and some round succeeds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::engine::Step;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub base_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub latency_multiplier: u32,
    pub round_increment_pct: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_ms: crate::config::BASE_ROUND_TIMEOUT.as_millis() as u64,
            min_ms: crate::config::MIN_ROUND_TIMEOUT.as_millis() as u64,
            max_ms: crate::config::MAX_ROUND_TIMEOUT.as_millis() as u64,
            latency_multiplier: crate::config::LATENCY_TIMEOUT_MULTIPLIER,
            round_increment_pct: crate::config::ROUND_TIMEOUT_INCREMENT_PCT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    config: TimeoutConfig,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Round-0 timeout for the measured average latency.
    pub fn base_timeout(&self, avg_latency: Duration) -> Duration {
        let min = Duration::from_millis(self.config.min_ms);
        let max = Duration::from_millis(self.config.max_ms.max(self.config.min_ms));
        let base = Duration::from_millis(self.config.base_ms);
        if avg_latency.is_zero() {
            return base.clamp(min, max);
        }
        let scaled = base.saturating_add(avg_latency.saturating_mul(self.config.latency_multiplier));
        scaled.clamp(min, max)
    }

    /// Timeout for `round`, growing linearly and capped at `max`.
    pub fn round_timeout(&self, avg_latency: Duration, round: u32) -> Duration {
        let t0 = self.base_timeout(avg_latency);
        let max = Duration::from_millis(self.config.max_ms.max(self.config.min_ms));
        let growth_ms = (t0.as_millis() as u128)
            * round as u128
            * self.config.round_increment_pct as u128
            / 100;
        let growth = Duration::from_millis(growth_ms.min(u64::MAX as u128) as u64);
        t0.saturating_add(growth).min(max)
    }

    /// Timeout for a step. Prevote and precommit waits only start once
    /// 2/3 of votes are in, so half the round timeout suffices for them.
    pub fn step_timeout(&self, step: Step, avg_latency: Duration, round: u32) -> Duration {
        let full = self.round_timeout(avg_latency, round);
        match step {
            Step::Prevote | Step::Precommit => {
                (full / 2).max(Duration::from_millis(self.config.min_ms))
            }
            _ => full,
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}
