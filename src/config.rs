//! Configuration types.
//!
//! Defaults are resolved once when a config is built; components receive a
//! finished struct and never merge partial overrides themselves.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Generation settings forwarded with every stream a turn opens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnConfig {
    /// Model override; the generator's default is used when unset.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Engine configuration shared by the turn engine and the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to a task attempt that does not set its own.
    pub default_task_timeout: Duration,
    /// Retry settings for transport retries and task re-attempts.
    pub retry: RetryConfig,
    /// Buffer size of each outbound event channel.
    pub event_capacity: usize,
    pub turn: TurnConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(300), // 5 minutes
            retry: RetryConfig::default(),
            event_capacity: 256,
            turn: TurnConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `ASSIST_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] but with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "ASSIST_TASK_TIMEOUT_SECS")? {
            config.default_task_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "ASSIST_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "ASSIST_RETRY_INITIAL_DELAY_MS")? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "ASSIST_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = parse_var::<f64, _>(&lookup, "ASSIST_RETRY_MULTIPLIER")? {
            config.retry.backoff_multiplier = m;
        }
        if let Some(model) = lookup("ASSIST_MODEL").filter(|m| !m.trim().is_empty()) {
            config.turn.model = Some(model);
        }

        config.retry.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
