//! Configuration management for Gatehouse.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{GatehouseError, Result};
use crate::queue::QueueStrategy;
use crate::ratelimit::RateLimitAlgorithm;

/// Prefix for environment overrides, e.g. `GATEHOUSE__QUEUE__MAX_CAPACITY=50`.
const ENV_PREFIX: &str = "GATEHOUSE";

/// Longest lifetime a queued item may be configured with (30 days).
pub const MAX_ITEM_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Largest per-window request allowance.
pub const MAX_REQUESTS_PER_WINDOW: u64 = 1_000_000;

/// Main configuration for the Gatehouse service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission rate limit
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Queue sizing and expiry
    #[serde(default)]
    pub queue: QueueSettings,

    /// Retry-After backoff
    #[serde(default)]
    pub backoff: BackoffSettings,

    /// Background task pacing
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Simulated downstream operation
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Counting algorithm
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::default(),
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_max_requests() -> u64 {
    2
}

fn default_window_secs() -> u64 {
    10
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// FIFO (waits for capacity) or priority (rejects when full)
    #[serde(default)]
    pub strategy: QueueStrategy,

    /// Maximum number of queued items
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,

    /// Lifetime of a queued item before it expires
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Assumed service time per item, used for wait estimates
    #[serde(default = "default_service_time_ms")]
    pub service_time_per_item_ms: u64,

    /// Number of cleanup records retained
    #[serde(default = "default_cleanup_history_limit")]
    pub cleanup_history_limit: usize,

    /// Upper bound on how long the HTTP layer waits for a FIFO slot
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            strategy: QueueStrategy::default(),
            max_capacity: default_max_capacity(),
            item_timeout_secs: default_item_timeout_secs(),
            service_time_per_item_ms: default_service_time_ms(),
            cleanup_history_limit: default_cleanup_history_limit(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

impl QueueSettings {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn service_time_per_item(&self) -> Duration {
        Duration::from_millis(self.service_time_per_item_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

fn default_max_capacity() -> usize {
    100
}

fn default_item_timeout_secs() -> u64 {
    300
}

fn default_service_time_ms() -> u64 {
    1000
}

fn default_cleanup_history_limit() -> usize {
    100
}

fn default_enqueue_timeout_ms() -> u64 {
    250
}

/// Adaptive Retry-After configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_base_retry_after_secs")]
    pub base_retry_after_secs: u64,

    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,

    /// Denominator of the system load signal
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Per-caller state idle longer than this is purged
    #[serde(default = "default_inactivity_window_secs")]
    pub inactivity_window_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_retry_after_secs: default_base_retry_after_secs(),
            max_retry_after_secs: default_max_retry_after_secs(),
            max_requests_per_minute: default_max_requests_per_minute(),
            inactivity_window_secs: default_inactivity_window_secs(),
        }
    }
}

fn default_base_retry_after_secs() -> u64 {
    1
}

fn default_max_retry_after_secs() -> u64 {
    60
}

fn default_max_requests_per_minute() -> u32 {
    60
}

fn default_inactivity_window_secs() -> u64 {
    600
}

/// Background task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Promoter idle sleep when nothing is queued
    #[serde(default = "default_empty_queue_delay_ms")]
    pub empty_queue_delay_ms: u64,

    /// Sweeper period
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            empty_queue_delay_ms: default_empty_queue_delay_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl WorkerSettings {
    pub fn empty_queue_delay(&self) -> Duration {
        Duration::from_millis(self.empty_queue_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_empty_queue_delay_ms() -> u64 {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    5
}

/// Simulated downstream operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            processing_delay_ms: default_processing_delay_ms(),
        }
    }
}

fn default_processing_delay_ms() -> u64 {
    1000
}

impl GatehouseConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatehouseError::Config(e.to_string()))
    }

    /// Load layered configuration: defaults, then an optional file, then
    /// `GATEHOUSE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: GatehouseConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_capacity == 0 {
            return Err(GatehouseError::Config("queue.max_capacity must be positive".into()));
        }
        if self.queue.max_capacity > Semaphore::MAX_PERMITS {
            return Err(GatehouseError::Config(format!(
                "queue.max_capacity must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.queue.item_timeout_secs > MAX_ITEM_TIMEOUT_SECS {
            return Err(GatehouseError::Config(format!(
                "queue.item_timeout_secs must be at most {MAX_ITEM_TIMEOUT_SECS}"
            )));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(GatehouseError::Config("rate_limit.window_secs must be positive".into()));
        }
        if self.rate_limit.max_requests > MAX_REQUESTS_PER_WINDOW {
            return Err(GatehouseError::Config(format!(
                "rate_limit.max_requests must be at most {MAX_REQUESTS_PER_WINDOW}"
            )));
        }
        if self.backoff.max_retry_after_secs < self.backoff.base_retry_after_secs {
            return Err(GatehouseError::Config(
                "backoff.max_retry_after_secs must not be below base_retry_after_secs".into(),
            ));
        }
        if self.backoff.max_requests_per_minute == 0 {
            return Err(GatehouseError::Config(
                "backoff.max_requests_per_minute must be positive".into(),
            ));
        }
        Ok(())
    }
}
