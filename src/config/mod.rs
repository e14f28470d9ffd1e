//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub telemetry: TelemetrySettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue: QueueConfig::from_env()?,
            telemetry: TelemetrySettings::from_env(),
        })
    }
}

/// Where telemetry goes and how verbose it is. Never fails to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl TelemetrySettings {
    pub fn from_env() -> Self {
        Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            default_filter: self.log_level.clone(),
        }
    }
}

/// Settings fixed for the lifetime of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Set key on every replica; also prefixes lock paths.
    pub key: String,
    /// Replicas that must acknowledge a push or clear.
    pub write_quorum: usize,
    /// Lock-conflict retries for [`crate::Queue::pop`].
    pub pop_tries: u32,
    /// Backoff between failed session starts.
    pub session_retry_ms: u64,
    /// Loosest acceptable replica reconnect ceiling.
    pub max_replica_retry_delay_ms: u64,
    /// Buffered diagnostic events per subscriber.
    pub diagnostic_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            write_quorum: 1,
            pop_tries: 1,
            session_retry_ms: 1000,
            max_replica_retry_delay_ms: 1000,
            diagnostic_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn write_quorum(mut self, w: usize) -> Self {
        self.write_quorum = w;
        self
    }

    pub fn pop_tries(mut self, tries: u32) -> Self {
        self.pop_tries = tries;
        self
    }

    pub fn session_retry(mut self, backoff: Duration) -> Self {
        self.session_retry_ms = backoff.as_millis() as u64;
        self
    }

    pub fn max_replica_retry_delay(mut self, limit: Duration) -> Self {
        self.max_replica_retry_delay_ms = limit.as_millis() as u64;
        self
    }

    pub fn diagnostic_capacity(mut self, capacity: usize) -> Self {
        self.diagnostic_capacity = capacity;
        self
    }

    pub fn session_retry_interval(&self) -> Duration {
        Duration::from_millis(self.session_retry_ms)
    }

    pub fn replica_retry_limit(&self) -> Duration {
        Duration::from_millis(self.max_replica_retry_delay_ms)
    }

    /// Load from environment. `QUEUE_KEY` is required; the rest default.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            key: required_var("QUEUE_KEY")?,
            write_quorum: optional_var("WRITE_QUORUM")?.unwrap_or(defaults.write_quorum),
            pop_tries: optional_var("POP_TRIES")?.unwrap_or(defaults.pop_tries),
            session_retry_ms: optional_var("SESSION_RETRY_MS")?
                .unwrap_or(defaults.session_retry_ms),
            max_replica_retry_delay_ms: optional_var("MAX_REPLICA_RETRY_DELAY_MS")?
                .unwrap_or(defaults.max_replica_retry_delay_ms),
            diagnostic_capacity: optional_var("DIAGNOSTIC_CAPACITY")?
                .unwrap_or(defaults.diagnostic_capacity),
        })
    }

    /// Parse a `[queue]` table from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct File {
            queue: QueueConfig,
        }

        let file: File =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
        Ok(file.queue)
    }

    /// Read a TOML file. An unreadable file is [`Error::Io`]; bad contents
    /// are [`Error::Config`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check the settings against the number of replicas they will drive.
    pub fn validate(&self, replicas: usize) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config("queue key must not be empty".to_string()));
        }
        if replicas == 0 {
            return Err(Error::Config("no replicas provided".to_string()));
        }
        if self.write_quorum == 0 || self.write_quorum > replicas {
            return Err(Error::Config(format!(
                "write quorum {} must be between 1 and {replicas}",
                self.write_quorum
            )));
        }
        if self.pop_tries == 0 {
            return Err(Error::Config("pop_tries must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
