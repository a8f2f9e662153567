use std::path::Path;
use std::time::Duration;

use mppexec_error::{ErrorKind, MppError, Result, ResultExt};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Configuration for everything the execution runtime sets up.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub scheduler: SchedulerConfig,
    pub exchange: ExchangeConfig,
    pub memory: MemoryConfig,
    /// Default log level, overridable with `RUST_LOG`.
    pub log_level: String,
    /// Either "text" or "json".
    pub log_format: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            scheduler: SchedulerConfig::default(),
            exchange: ExchangeConfig::default(),
            memory: MemoryConfig::default(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to parse execution config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .context_fn(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_threads == 0 {
            return Err(invalid("scheduler.worker_threads must be at least 1"));
        }
        if self.scheduler.time_slice_ms == 0 {
            return Err(invalid("scheduler.time_slice_ms must be greater than zero"));
        }
        if self.scheduler.timeout_sweep_interval_ms == 0 {
            return Err(invalid(
                "scheduler.timeout_sweep_interval_ms must be greater than zero",
            ));
        }
        if self.exchange.io_threads == 0 {
            return Err(invalid("exchange.io_threads must be at least 1"));
        }
        if self.exchange.max_attempts == 0 {
            return Err(invalid("exchange.max_attempts must be at least 1"));
        }
        if self.memory.max_bytes == 0 {
            return Err(invalid("memory.max_bytes must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> MppError {
    MppError::with_kind(ErrorKind::InvalidArgument, msg)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
    pub time_slice_ms: u64,
    /// Deadline for each driver task, measured from submission.
    pub query_timeout_ms: u64,
    pub timeout_sweep_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_threads: num_cpus::get().max(1),
            time_slice_ms: 100,
            query_timeout_ms: 60_000,
            timeout_sweep_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Threads running fetch and acknowledge calls.
    pub io_threads: usize,
    /// Attempts per remote call before the failure is reported.
    pub max_attempts: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            io_threads: 4,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub max_bytes: u64,
    /// Defaults to half of `max_bytes` when not set.
    pub max_bytes_per_query: Option<u64>,
}

impl MemoryConfig {
    pub fn max_bytes_per_query(&self) -> u64 {
        self.max_bytes_per_query.unwrap_or(self.max_bytes / 2)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            max_bytes_per_query: None,
        }
    }
}
