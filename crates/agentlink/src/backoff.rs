//! Reconnection backoff with exponential growth and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff between reconnection attempts.
///
/// The delay before retry `n` (1-based) is
/// `min(initial * multiplier^(n-1), max_interval)`, scaled by a random
/// factor in `1 ± jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Cap on the un-jittered delay, in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Growth factor per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Relative jitter, 0.0 to 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Retries before giving up (0 = give up on the first loss)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_retries() -> u32 {
    5
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = (self.initial_ms as f64 * self.multiplier.powi(exponent)).min(self.max_interval_ms as f64);
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    /// Jittered delay before retry `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: 500,
            max_interval_ms: 4_000,
            multiplier: 2.0,
            jitter,
            max_retries: 3,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = policy(0.0);
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy(0.25);
        for retry in 1..=5 {
            let base = policy.base_delay(retry).as_secs_f64();
            for _ in 0..100 {
                let delay = policy.delay_for(retry).as_secs_f64();
                assert!(delay >= base * 0.75 - 1e-9 && delay <= base * 1.25 + 1e-9);
            }
        }
    }

    #[test]
    fn test_defaults_from_partial_toml() {
        let policy: BackoffPolicy = toml::from_str("max_retries = 8").unwrap();
        assert_eq!(policy.max_retries, 8);
        assert_eq!(policy.initial_ms, 1_000);
    }
}
