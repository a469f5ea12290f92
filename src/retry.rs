//! Retry eligibility and exponential backoff with jitter.
//!
//! Shared by the turn engine (transport retries when opening a generation
//! stream) and the workflow engine (task re-attempts). The policy itself is
//! pure: the only source of non-determinism is the [`JitterSource`], which is
//! injectable so tests can pin delays.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fraction of the computed delay used as symmetric jitter (±30%).
pub const JITTER_RATIO: f64 = 0.3;

/// Coarse classification of any failure the engines may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection reset, DNS failure, interrupted stream.
    Network,
    Timeout,
    RateLimit,
    /// 5xx-class server failures.
    Transient,
    /// Malformed input or a request the backend rejected outright.
    InvalidInput,
    Auth,
    /// A tool or task body reported failure.
    Invocation,
    /// Misuse of the engine API.
    StateViolation,
    Cancelled,
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Transient => "transient",
            Self::InvalidInput => "invalid_input",
            Self::Auth => "auth",
            Self::Invocation => "invocation",
            Self::StateViolation => "state_violation",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Anything that can be mapped onto an [`ErrorCategory`].
pub trait Classify {
    fn category(&self) -> ErrorCategory;
}

impl Classify for ErrorCategory {
    fn category(&self) -> ErrorCategory {
        *self
    }
}

/// Error categories a [`RetryConfig`] may opt into retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    Network,
    Timeout,
    RateLimit,
    Transient,
}

impl RetryCondition {
    pub const ALL: [RetryCondition; 4] = [
        RetryCondition::Network,
        RetryCondition::Timeout,
        RetryCondition::RateLimit,
        RetryCondition::Transient,
    ];

    /// Whether an error of `category` satisfies this condition.
    pub fn matches(&self, category: ErrorCategory) -> bool {
        matches!(
            (self, category),
            (Self::Network, ErrorCategory::Network)
                | (Self::Timeout, ErrorCategory::Timeout)
                | (Self::RateLimit, ErrorCategory::RateLimit)
                | (Self::Transient, ErrorCategory::Transient)
        )
    }
}

/// Retry configuration. Treated as immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retry_conditions: HashSet<RetryCondition>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            retry_conditions: RetryCondition::ALL.into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// Reject configurations that would produce shrinking or inverted delays.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "backoff_multiplier".to_string(),
                message: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::InvalidValue {
                key: "initial_delay".to_string(),
                message: format!(
                    "{:?} exceeds max_delay {:?}",
                    self.initial_delay, self.max_delay
                ),
            });
        }
        Ok(())
    }

    /// Un-jittered delay for `attempt`: `min(initial * multiplier^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_nanos() as f64;
        Duration::from_nanos(raw.min(max).max(0.0).round() as u64)
    }
}

/// Source of jitter samples in `[-1.0, 1.0]`.
pub trait JitterSource: Send + Sync + fmt::Debug {
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Constant jitter, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

/// Computes retry eligibility and backoff delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    jitter: Arc<dyn JitterSource>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_jitter(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    /// True only if `attempt < max_attempts` and the error matches a configured condition.
    pub fn should_retry<E: Classify + ?Sized>(
        &self,
        error: &E,
        attempt: u32,
        config: &RetryConfig,
    ) -> bool {
        if attempt >= config.max_attempts {
            return false;
        }
        let category = error.category();
        config
            .retry_conditions
            .iter()
            .any(|condition| condition.matches(category))
    }

    /// Backoff delay for `attempt` with ±30% jitter, never above `max_delay`.
    pub fn next_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        let base = config.base_delay(attempt).as_nanos() as f64;
        let factor = 1.0 + JITTER_RATIO * self.jitter.sample().clamp(-1.0, 1.0);
        let jittered = Duration::from_nanos((base * factor).max(0.0).round() as u64);
        jittered.min(config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            retry_conditions: RetryCondition::ALL.into_iter().collect(),
        }
    }

    #[test]
    fn retries_matching_errors_until_budget_exhausted() {
        let policy = RetryPolicy::new();
        let cfg = config();
        assert!(policy.should_retry(&ErrorCategory::Network, 0, &cfg));
        assert!(policy.should_retry(&ErrorCategory::RateLimit, 2, &cfg));
        assert!(!policy.should_retry(&ErrorCategory::Network, 3, &cfg));
    }

    #[test]
    fn never_retries_non_matching_errors() {
        let policy = RetryPolicy::new();
        let cfg = config();
        for category in [
            ErrorCategory::InvalidInput,
            ErrorCategory::Auth,
            ErrorCategory::StateViolation,
            ErrorCategory::Cancelled,
        ] {
            assert!(!policy.should_retry(&category, 0, &cfg), "{category}");
        }
    }

    #[test]
    fn respects_configured_conditions() {
        let policy = RetryPolicy::new();
        let mut cfg = config();
        cfg.retry_conditions = [RetryCondition::Timeout].into_iter().collect();
        assert!(policy.should_retry(&ErrorCategory::Timeout, 0, &cfg));
        assert!(!policy.should_retry(&ErrorCategory::Network, 0, &cfg));
    }

    #[test]
    fn base_delay_grows_exponentially_and_caps() {
        let cfg = config();
        assert_eq!(cfg.base_delay(0), Duration::from_millis(100));
        assert_eq!(cfg.base_delay(1), Duration::from_millis(200));
        assert_eq!(cfg.base_delay(3), Duration::from_millis(800));
        assert_eq!(cfg.base_delay(4), Duration::from_millis(1000));
        assert_eq!(cfg.base_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn fixed_jitter_is_deterministic() {
        let cfg = config();
        let high = RetryPolicy::with_jitter(Arc::new(FixedJitter(1.0)));
        let low = RetryPolicy::with_jitter(Arc::new(FixedJitter(-1.0)));
        let none = RetryPolicy::with_jitter(Arc::new(FixedJitter(0.0)));

        assert_eq!(none.next_delay(1, &cfg), Duration::from_millis(200));
        assert_eq!(high.next_delay(1, &cfg).as_millis(), 260);
        assert_eq!(low.next_delay(1, &cfg).as_millis(), 140);
        // Capped value plus positive jitter is clamped to max_delay.
        assert_eq!(high.next_delay(10, &cfg), Duration::from_millis(1000));
    }

    #[test]
    fn random_delays_stay_within_jitter_band() {
        let cfg = config();
        let policy = RetryPolicy::new();
        for attempt in 0..8 {
            let base = cfg.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.next_delay(attempt, &cfg);
                let secs = delay.as_secs_f64();
                assert!(secs >= base * 0.7 - 1e-9, "attempt {attempt}: {secs} < {base}*0.7");
                assert!(secs <= base * 1.3 + 1e-9, "attempt {attempt}: {secs} > {base}*1.3");
                assert!(delay <= cfg.max_delay);
            }
        }
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let mut cfg = config();
        cfg.backoff_multiplier = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.initial_delay = Duration::from_secs(5);
        assert!(cfg.validate().is_err());

        assert!(config().validate().is_ok());
    }
}
