use crate::error::EngineError;
use serde::Deserialize;
use std::{
    fs,
    path::Path,
    time::Duration,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub confirmation_timeout: Duration,
    pub resolution_timeout: Duration,
    pub reorder_window: Duration,
    pub retention_window: Duration,
    pub tick_interval: Duration,
    pub poll_interval: Duration,
    pub confirmations: u64,
    pub max_block_range: u64,
    pub start_block: u64,
    pub subscription_buffer: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(60),
            resolution_timeout: Duration::from_secs(300),
            reorder_window: Duration::from_secs(30),
            retention_window: Duration::from_secs(600),
            tick_interval: Duration::from_millis(250),
            poll_interval: Duration::from_secs(2),
            confirmations: 1,
            max_block_range: 2_000,
            start_block: 0,
            subscription_buffer: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        let config = file.apply(Self::default());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let non_zero = [
            ("confirmation_timeout", self.confirmation_timeout),
            ("resolution_timeout", self.resolution_timeout),
            ("tick_interval", self.tick_interval),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }
        if self.resolution_timeout < self.confirmation_timeout {
            return Err(EngineError::Config(
                "resolution_timeout must not be shorter than confirmation_timeout".into(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(EngineError::Config(
                "subscription_buffer must be positive".into(),
            ));
        }
        if self.max_block_range == 0 {
            return Err(EngineError::Config("max_block_range must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// On-disk shape of [`EngineConfig`]; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    confirmation_timeout_ms: Option<u64>,
    resolution_timeout_ms: Option<u64>,
    reorder_window_ms: Option<u64>,
    retention_window_ms: Option<u64>,
    tick_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    confirmations: Option<u64>,
    max_block_range: Option<u64>,
    start_block: Option<u64>,
    subscription_buffer: Option<usize>,
    retry: Option<RetryFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryFile {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

impl ConfigFile {
    fn apply(self, base: EngineConfig) -> EngineConfig {
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let retry = match self.retry {
            Some(retry) => RetryPolicy {
                max_attempts: retry.max_attempts.unwrap_or(base.retry.max_attempts),
                initial_backoff: ms(retry.initial_backoff_ms, base.retry.initial_backoff),
                max_backoff: ms(retry.max_backoff_ms, base.retry.max_backoff),
            },
            None => base.retry,
        };
        EngineConfig {
            confirmation_timeout: ms(
                self.confirmation_timeout_ms,
                base.confirmation_timeout,
            ),
            resolution_timeout: ms(self.resolution_timeout_ms, base.resolution_timeout),
            reorder_window: ms(self.reorder_window_ms, base.reorder_window),
            retention_window: ms(self.retention_window_ms, base.retention_window),
            tick_interval: ms(self.tick_interval_ms, base.tick_interval),
            poll_interval: ms(self.poll_interval_ms, base.poll_interval),
            confirmations: self.confirmations.unwrap_or(base.confirmations),
            max_block_range: self.max_block_range.unwrap_or(base.max_block_range),
            start_block: self.start_block.unwrap_or(base.start_block),
            subscription_buffer: self
                .subscription_buffer
                .unwrap_or(base.subscription_buffer),
            retry,
        }
    }
}
