use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Retry budget and exponential backoff for transient backend failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Backend dispatcher settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    /// Timeout for a single backend call (default: 30 seconds).
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Concurrent calls allowed per backend address (default: 64).
    pub max_in_flight_per_backend: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            max_in_flight_per_backend: 64,
        }
    }
}

/// Pipeline executor settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Budget for a whole pipeline invocation (default: 60 seconds).
    #[serde(rename = "invocation_timeout_ms", with = "millis")]
    pub invocation_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.dispatch.max_in_flight_per_backend == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight_per_backend must be at least 1".into(),
            ));
        }
        if self.dispatch.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("call_timeout_ms must be non-zero".into()));
        }
        if self.executor.invocation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "invocation_timeout_ms must be non-zero".into(),
            ));
        }
        if !self.dispatch.retry.backoff_multiplier.is_finite() {
            return Err(ConfigError::Invalid("backoff_multiplier must be finite".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(350));
        assert_eq!(p.delay_for(9), Duration::from_millis(350));
    }

    #[test]
    fn none_policy_has_no_retries() {
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = EngineConfig::from_json(
            r#"{"dispatch": {"retry": {"max_retries": 1}, "call_timeout_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(c.dispatch.retry.max_retries, 1);
        assert_eq!(c.dispatch.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(c.dispatch.call_timeout, Duration::from_millis(250));
        assert_eq!(c.executor.invocation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn empty_json_is_default() {
        assert_eq!(EngineConfig::from_json("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn zero_in_flight_is_rejected() {
        let err = EngineConfig::from_json(r#"{"dispatch": {"max_in_flight_per_backend": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_invocation_timeout_is_rejected() {
        let err =
            EngineConfig::from_json(r#"{"executor": {"invocation_timeout_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
