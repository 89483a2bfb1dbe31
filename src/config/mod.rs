//! Configuration management for doubleteam
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use doubleteam::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Server listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `DOUBLETEAM__<section>__<key>`
//!
//! Examples:
//! - `DOUBLETEAM__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `DOUBLETEAM__PRIMARY__ENDPOINT=http://stream:8082`
//! - `DOUBLETEAM__OVERFLOW__FLUSH_FREQUENCY=2s`
//!
//! S3 credentials are read from `S3_ACCESS_KEY` / `S3_SECRET_KEY`, falling
//! back to `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/doubleteam.toml`.
//! This can be overridden using the `DOUBLETEAM_CONFIG` environment variable
//! or the `--config` flag.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    BreakerConfig, Config, LogConfig, OverflowConfig, PrimaryConfig, ServerConfig,
    StorageProvider, TelemetryConfig,
};
pub use validation::ValidationError;

use std::path::PathBuf;
use thiserror::Error;

use crate::streaming::{BatchConfig, HttpConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment + secrets)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Like [`Config::load`], reading the file at `path` when given
    pub fn load_with(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, without environment secrets
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

impl PrimaryConfig {
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig::builder()
            .endpoint(self.endpoint.clone())
            .connect_timeout(self.connect_timeout.into())
            .request_timeout(self.request_timeout.into())
            .max_retries(self.retry)
            .retry_backoff(self.retry_backoff.into())
            .breaker_threshold(self.breaker.error_threshold)
            .breaker_timeout(self.breaker.timeout.into())
            .max_in_flight(self.max_in_flight)
            .build()
    }
}

impl OverflowConfig {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::builder()
            .flush_messages(self.flush_messages)
            .flush_frequency(self.flush_frequency.into())
            .prefix(self.prefix.clone())
            .build()
    }
}
