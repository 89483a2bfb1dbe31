use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub overflow: OverflowConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP front end and pipeline sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Capacity of every queue in the fallback chain
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
    /// Upper bound on draining the pipeline at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: HumanDuration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            queue_size: default_queue_size(),
            max_payload_bytes: default_max_payload_bytes(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize(1024 * 1024) // 1 MB
}

fn default_shutdown_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

/// Primary stream producer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrimaryConfig {
    #[serde(default = "default_primary_endpoint")]
    pub endpoint: String,
    /// Retries after the first attempt
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    /// Concurrent publishes
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_primary_endpoint(),
            retry: default_retry(),
            retry_backoff: default_retry_backoff(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            max_in_flight: default_max_in_flight(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_primary_endpoint() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_retry() -> u32 {
    5
}

fn default_retry_backoff() -> HumanDuration {
    HumanDuration::from_millis(10)
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_max_in_flight() -> usize {
    64
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// How long the breaker stays open
    #[serde(default = "default_breaker_timeout")]
    pub timeout: HumanDuration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            timeout: default_breaker_timeout(),
        }
    }
}

fn default_error_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> HumanDuration {
    HumanDuration::from_secs(1)
}

/// Storage provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Memory,
    #[default]
    Local,
    S3,
}

/// Durable overflow store
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverflowConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the local provider
    #[serde(default = "default_root")]
    pub root: PathBuf,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// S3 access key (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, not from config file)
    #[serde(skip)]
    pub secret_key: Option<String>,
    /// Key prefix for batch objects
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_flush_messages")]
    pub flush_messages: usize,
    #[serde(default = "default_flush_frequency")]
    pub flush_frequency: HumanDuration,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            root: default_root(),
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: default_prefix(),
            flush_messages: default_flush_messages(),
            flush_frequency: default_flush_frequency(),
        }
    }
}

fn default_bucket() -> String {
    "doubleteam-overflow".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("data/overflow")
}

fn default_prefix() -> String {
    "overflow".to_string()
}

fn default_flush_messages() -> usize {
    20_000
}

fn default_flush_frequency() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// How often queue depth is sampled
    #[serde(default = "default_telemetry_interval")]
    pub interval: HumanDuration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: default_telemetry_interval(),
        }
    }
}

fn default_telemetry_interval() -> HumanDuration {
    HumanDuration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
