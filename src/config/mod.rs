//! Typed configuration.
//!
//! Process-level values (connection strings, telemetry) come from environment
//! variables and fail fast if required ones are missing. Worker tuning comes
//! from an optional TOML settings file; every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Identity written into lock records and log events.
    pub worker_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_name: std::env::var("UOWQ_WORKER_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| format!("uowq-{}", uuid::Uuid::new_v4())),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Worker settings
// ---------------------------------------------------------------------------

/// Tuning for the batch loop and its components.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Queue to consume.
    pub queue_name: String,
    /// Maximum items per fetch.
    pub batch_size: u32,
    /// How long fetched items stay invisible to other consumers.
    pub lease_seconds: u32,
    /// Delay before an item acked as not completed is redelivered.
    pub visibility_timeout_seconds: u32,
    /// Lock record TTL. `-1` = never expires.
    pub lock_ttl_seconds: i64,
    /// Dispatcher worker count. `0` = available cores.
    pub parallelism: usize,
    /// Grace delay before retry bookkeeping of completed items is deleted.
    pub cleanup_delay_ms: u64,
    /// Upper bound on how long `stop` waits for the loop to exit.
    pub max_stop_wait_ms: u64,
    /// How often `stop` checks whether the loop exited.
    pub stop_poll_interval_ms: u64,
    /// Pause before the next fetch after an empty or failed fetch.
    pub idle_wait_ms: u64,
    pub processor: ProcessorSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorSettings {
    /// Executable run once per unit of work.
    pub command: PathBuf,
    pub timeout_seconds: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_name: "uow".to_string(),
            batch_size: 10,
            lease_seconds: 30,
            visibility_timeout_seconds: 30,
            lock_ttl_seconds: 30,
            parallelism: 0,
            cleanup_delay_ms: 2_000,
            max_stop_wait_ms: 5_000,
            stop_poll_interval_ms: 100,
            idle_wait_ms: 1_000,
            processor: ProcessorSettings::default(),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            command: PathBuf::from("./hooks/process"),
            timeout_seconds: 300,
        }
    }
}

impl WorkerSettings {
    /// Load settings from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.lock_ttl_seconds < -1 || self.lock_ttl_seconds == 0 {
            return Err(Error::Config(format!(
                "lock_ttl_seconds must be -1 or positive, got {}",
                self.lock_ttl_seconds
            )));
        }
        if self.stop_poll_interval_ms == 0 {
            return Err(Error::Config(
                "stop_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock TTL, `None` when locks never expire.
    pub fn lock_ttl(&self) -> Option<Duration> {
        u64::try_from(self.lock_ttl_seconds)
            .ok()
            .map(Duration::from_secs)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn max_stop_wait(&self) -> Duration {
        Duration::from_millis(self.max_stop_wait_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor.timeout_seconds)
    }
}
