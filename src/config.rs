use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_lock_ttl", with = "duration_ms")]
    pub lock_ttl: Duration,

    #[serde(default = "default_lock_retry_interval", with = "duration_ms")]
    pub lock_retry_interval: Duration,

    /// How long a dispatched request may wait on a conversation lock before
    /// a `completion:lock_timeout` notification is published. The claim is
    /// not abandoned; the notification fires once.
    #[serde(default = "default_lock_wait_timeout", with = "duration_ms")]
    pub lock_wait_timeout: Duration,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_concurrency: default_worker_concurrency(),
            lock_ttl: default_lock_ttl(),
            lock_retry_interval: default_lock_retry_interval(),
            lock_wait_timeout: default_lock_wait_timeout(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}

/// Fallback chain limits for injection configs that leave a bound unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_token_budget")]
    pub token_budget: u64,

    #[serde(default = "default_time_window", with = "duration_ms")]
    pub time_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            token_budget: default_token_budget(),
            time_window: default_time_window(),
        }
    }
}

/// Backoff policy for retryable provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "duration_ms")]
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_queue_capacity() -> usize {
    256
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_lock_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_lock_retry_interval() -> Duration {
    Duration::from_millis(250)
}
fn default_lock_wait_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_max_depth() -> u32 {
    5
}
fn default_token_budget() -> u64 {
    50_000
}
fn default_time_window() -> Duration {
    Duration::from_secs(600)
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
