use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::retry::RetryPolicy;

/// Batch subsystem configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Admission guard: maximum items in a single batch.
    pub max_items_per_batch: usize,
    /// Backpressure ceiling: total items across all non-terminal batches.
    pub max_in_flight_items: usize,
    /// How long a terminal batch is kept before eviction.
    pub retention: Duration,
    /// How often the TTL sweeper runs.
    pub sweep_interval: Duration,
    /// Number of recent events replayed to a new subscriber.
    pub replay_buffer_size: usize,
    /// Bounded channel depth per subscriber; a full channel drops the
    /// subscriber.
    pub subscriber_capacity: usize,
    /// Number of concurrent worker loops.
    pub worker_count: usize,
    pub retry: RetryPolicy,
    /// Root directory for item outputs.
    pub output_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 100,
            max_in_flight_items: 1000,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            replay_buffer_size: 50,
            subscriber_capacity: 64,
            worker_count: 2,
            retry: RetryPolicy::default(),
            output_dir: PathBuf::from("./data/batches"),
        }
    }
}

impl BatchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default          |
    /// |-----------------------------|------------------|
    /// | `BATCH_MAX_ITEMS`           | `100`            |
    /// | `BATCH_MAX_IN_FLIGHT_ITEMS` | `1000`           |
    /// | `BATCH_RETENTION_SECS`      | `3600`           |
    /// | `BATCH_SWEEP_INTERVAL_SECS` | `60`             |
    /// | `BATCH_REPLAY_BUFFER`       | `50`             |
    /// | `BATCH_SUBSCRIBER_CAPACITY` | `64`             |
    /// | `BATCH_WORKERS`             | `2`              |
    /// | `BATCH_RETRY_MAX_ATTEMPTS`  | `3`              |
    /// | `BATCH_RETRY_INITIAL_MS`    | `500`            |
    /// | `BATCH_RETRY_MAX_MS`        | `10000`          |
    /// | `BATCH_OUTPUT_DIR`          | `./data/batches` |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();

        let retry = RetryPolicy::new(
            env_or("BATCH_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            Duration::from_millis(env_or(
                "BATCH_RETRY_INITIAL_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )?),
            Duration::from_millis(env_or(
                "BATCH_RETRY_MAX_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )?),
        );

        let config = Self {
            max_items_per_batch: env_or("BATCH_MAX_ITEMS", defaults.max_items_per_batch)?,
            max_in_flight_items: env_or(
                "BATCH_MAX_IN_FLIGHT_ITEMS",
                defaults.max_in_flight_items,
            )?,
            retention: Duration::from_secs(env_or(
                "BATCH_RETENTION_SECS",
                defaults.retention.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(env_or(
                "BATCH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            replay_buffer_size: env_or("BATCH_REPLAY_BUFFER", defaults.replay_buffer_size)?,
            subscriber_capacity: env_or(
                "BATCH_SUBSCRIBER_CAPACITY",
                defaults.subscriber_capacity,
            )?,
            worker_count: env_or("BATCH_WORKERS", defaults.worker_count)?,
            retry,
            output_dir: std::env::var("BATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_items_per_batch == 0 {
            return Err(CoreError::Validation(
                "BATCH_MAX_ITEMS must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight_items < self.max_items_per_batch {
            return Err(CoreError::Validation(
                "BATCH_MAX_IN_FLIGHT_ITEMS must be at least BATCH_MAX_ITEMS".to_string(),
            ));
        }
        if self.subscriber_capacity == 0 {
            return Err(CoreError::Validation(
                "BATCH_SUBSCRIBER_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(CoreError::Validation(
                "BATCH_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(CoreError::Validation(
                "BATCH_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Read and parse an environment variable, falling back to `default` when
/// it is unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{key} has an invalid value: '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}
