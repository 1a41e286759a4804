//! Category-aware backoff with jitter
//!
//! Each [`ErrorCategory`] has its own growth curve and cap. Server-provided
//! retry hints are honoured as-is (capped); everything else is jittered to keep
//! concurrent callers from retrying in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classifier::{ErrorCategory, ErrorClassification};

/// Per-category upper bounds in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCaps {
    pub rate_limit_ms: u64,
    pub backend_ms: u64,
    pub blockhash_ms: u64,
    pub network_ms: u64,
    pub generic_ms: u64,
}

impl Default for CategoryCaps {
    fn default() -> Self {
        Self {
            rate_limit_ms: 300_000,
            backend_ms: 60_000,
            blockhash_ms: 10_000,
            network_ms: 60_000,
            generic_ms: 20_000,
        }
    }
}

impl CategoryCaps {
    pub fn cap_for(&self, category: ErrorCategory) -> u64 {
        match category {
            ErrorCategory::RateLimit => self.rate_limit_ms,
            ErrorCategory::Backend => self.backend_ms,
            ErrorCategory::Blockhash => self.blockhash_ms,
            ErrorCategory::Network => self.network_ms,
            ErrorCategory::Client | ErrorCategory::Generic => self.generic_ms,
        }
    }
}

/// Backoff tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First rate-limit wait
    pub rate_limit_base_ms: u64,
    /// Exponential growth factor for rate-limit waits
    pub rate_limit_factor: f64,
    /// Linear step per attempt for backend failures
    pub backend_step_ms: u64,
    /// Linear step per attempt for stale-blockhash failures
    pub blockhash_step_ms: u64,
    /// Linear step per attempt for network failures
    pub network_step_ms: u64,
    /// Linear step per attempt for everything else
    pub generic_step_ms: u64,
    pub caps: CategoryCaps,
    /// Floor applied to every computed wait
    pub min_wait_ms: u64,
    /// Jitter multiplier window, inclusive
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Upper bound on retry hints extracted from relay responses
    pub max_retry_after_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_base_ms: 60_000,
            rate_limit_factor: 1.5,
            backend_step_ms: 7_000,
            blockhash_step_ms: 2_000,
            network_step_ms: 5_000,
            generic_step_ms: 3_000,
            caps: CategoryCaps::default(),
            min_wait_ms: 1_000,
            jitter_min: 0.5,
            jitter_max: 1.0,
            max_retry_after_ms: 300_000,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.jitter_min.is_finite() && self.jitter_max.is_finite()) {
            return Err("jitter window must be finite".to_string());
        }
        if self.jitter_min <= 0.0 || self.jitter_min > self.jitter_max {
            return Err(format!(
                "jitter window [{}, {}] must satisfy 0 < min <= max",
                self.jitter_min, self.jitter_max
            ));
        }
        if self.rate_limit_factor < 1.0 {
            return Err("rate_limit_factor must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Converts a classification and attempt number into a wait
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Capped, unjittered delay for a 1-based attempt number
    pub fn base_delay_ms(&self, classification: &ErrorClassification, attempt: u32) -> u64 {
        let cap = self.config.caps.cap_for(classification.category);
        if let Some(ms) = classification.retry_after_ms {
            return ms.min(cap);
        }

        let n = attempt.max(1) as u64;
        let raw = match classification.category {
            ErrorCategory::RateLimit => {
                let exp = self.config.rate_limit_factor.powi((n - 1) as i32);
                let ms = self.config.rate_limit_base_ms as f64 * exp;
                if ms.is_finite() {
                    ms.min(u64::MAX as f64) as u64
                } else {
                    u64::MAX
                }
            }
            ErrorCategory::Backend => self.config.backend_step_ms.saturating_mul(n),
            ErrorCategory::Blockhash => self.config.blockhash_step_ms.saturating_mul(n),
            ErrorCategory::Network => self.config.network_step_ms.saturating_mul(n),
            ErrorCategory::Client | ErrorCategory::Generic => {
                self.config.generic_step_ms.saturating_mul(n)
            }
        };
        raw.min(cap)
    }

    /// Final wait before the next attempt
    ///
    /// Retry hints bypass jitter; every result is floored at `min_wait_ms`.
    pub fn delay_for(&self, classification: &ErrorClassification, attempt: u32) -> Duration {
        let base = self.base_delay_ms(classification, attempt);
        let ms = if classification.retry_after_ms.is_some() {
            base
        } else {
            (base as f64 * self.jitter_factor()).round() as u64
        };
        Duration::from_millis(ms.max(self.config.min_wait_ms))
    }

    fn jitter_factor(&self) -> f64 {
        let (lo, hi) = (self.config.jitter_min, self.config.jitter_max);
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
