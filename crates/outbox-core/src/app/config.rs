//! WorkerConfig - static configuration for one outbox worker instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::OutboxError;

/// Advisory-lock key shared by every instance competing for leadership.
pub const DEFAULT_LOCK_KEY: i64 = 7_241_001;

/// Field names double as config-file keys and, upper-cased, as `OUTBOX_*`
/// environment variable suffixes in the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// `false`: `run` returns immediately without touching the store.
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub heartbeat_interval_seconds: u64,
    pub lock_key: i64,

    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    /// How long shutdown waits for in-flight handlers before detaching them.
    pub drain_timeout_seconds: u64,
    /// Jobs left in `processing` longer than this are reclaimed by the
    /// leader. `None` disables reclaim.
    pub processing_timeout_seconds: Option<u64>,
    /// Heartbeat identity. Generated at startup when absent.
    pub instance_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 5,
            batch_size: 10,
            max_concurrent: 5,
            heartbeat_interval_seconds: 30,
            lock_key: DEFAULT_LOCK_KEY,
            retry_base_delay_seconds: 2,
            retry_max_delay_seconds: 3600,
            drain_timeout_seconds: 30,
            processing_timeout_seconds: Some(600),
            instance_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_seconds)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_seconds.map(Duration::from_secs)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), OutboxError> {
        let invalid = |msg: &str| Err(OutboxError::Validation(msg.to_string()));
        if self.poll_interval_seconds == 0 {
            return invalid("poll_interval_seconds must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be at least 1");
        }
        if self.retry_base_delay_seconds > self.retry_max_delay_seconds {
            return invalid("retry_base_delay_seconds must not exceed retry_max_delay_seconds");
        }
        if self.processing_timeout_seconds == Some(0) {
            return invalid("processing_timeout_seconds must be at least 1 when set");
        }
        Ok(())
    }
}
