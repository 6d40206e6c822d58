//! Config - 実行時設定
//!
//! すべて `Default` を持つ素の struct です。デーモン側は JSON から読み込めます。
//! Queue のフィルタや比較関数はクロージャなので、ここではなく `QueueConfig` でコードとして渡します。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Worker-thread pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of live worker threads.
    pub thread_limit: usize,
}

impl DispatcherConfig {
    pub const DEFAULT_THREAD_LIMIT: usize = 24;

    pub fn with_thread_limit(thread_limit: usize) -> Self {
        Self { thread_limit }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.thread_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "dispatcher.thread_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_limit: Self::DEFAULT_THREAD_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Processors created on the default queue when none are supplied.
    pub processors: usize,

    /// Route pushes through `Executor::run_on_control_thread`.
    pub serialize_pushes: bool,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.processors == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scheduler.processors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processors: 1,
            serialize_pushes: false,
        }
    }
}

/// Top-level settings for a daemon built on the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoostConfig {
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
}

impl RoostConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SchedulerError> {
        let config: RoostConfig = serde_json::from_str(json)
            .map_err(|e| SchedulerError::InvalidConfig(format!("json decode: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::InvalidConfig(format!("read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.dispatcher.validate()?;
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RoostConfig::default();
        assert_eq!(config.dispatcher.thread_limit, 24);
        assert_eq!(config.scheduler.processors, 1);
        assert!(!config.scheduler.serialize_pushes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = RoostConfig::from_json_str(r#"{ "dispatcher": { "thread_limit": 4 } }"#)
            .unwrap();
        assert_eq!(config.dispatcher.thread_limit, 4);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = RoostConfig::from_json_str(r#"{ "dispatcher": { "thread_limit": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(msg) if msg.contains("thread_limit")));

        let err = RoostConfig::from_json_str(r#"{ "scheduler": { "processors": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = RoostConfig::from_json_str("{ nope").unwrap_err();
        assert!(err.to_string().contains("json decode"));
    }
}
