//! Configuration Module
//!
//! Handles loading and managing engine configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the storefront REST API
    pub api_base_url: String,
    /// Realtime channel endpoint
    pub ws_endpoint: String,
    /// Fixed timeout applied to every network call, in milliseconds
    pub request_timeout_ms: u64,
    /// Default freshness window for cached entries, in milliseconds
    pub default_stale_ms: u64,
    /// Maximum number of entries the cache holds
    pub max_entries: usize,
    /// First reconnect delay, in milliseconds
    pub reconnect_base_ms: u64,
    /// Upper bound for a reconnect delay, in milliseconds
    pub reconnect_max_ms: u64,
    /// Failed connect attempts before reconnection stops
    pub reconnect_max_attempts: u32,
    /// Attempt ceiling for timeout and rate-limit retries
    pub retry_max_attempts: u32,
    /// First retry delay, in milliseconds
    pub retry_base_ms: u64,
    /// Upper bound for a retry delay before jitter, in milliseconds
    pub retry_max_ms: u64,
    /// Random jitter added to each retry delay, in milliseconds
    pub retry_jitter_ms: u64,
    /// Delay before refetching after a network failure, in milliseconds
    pub network_retry_delay_ms: u64,
    /// Number of classified errors kept for diagnostics
    pub error_log_capacity: usize,
    /// Age after which classified errors leave the log, in seconds
    pub error_log_window_secs: u64,
    /// Outbound realtime messages buffered while connected
    pub outbound_buffer: usize,
    /// File holding the client id and session markers
    pub session_path: PathBuf,
    /// Port of the local diagnostics HTTP surface
    pub diagnostics_port: u16,
    /// Interval of the background maintenance task, in seconds
    pub maintenance_interval: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `API_BASE_URL` - REST API base (default: http://localhost:8080/api)
    /// - `WS_ENDPOINT` - realtime endpoint (default: ws://localhost:8080/ws)
    /// - `REQUEST_TIMEOUT_MS` - network timeout (default: 10000)
    /// - `DEFAULT_STALE_MS` - freshness window (default: 30000)
    /// - `MAX_ENTRIES` - cache capacity (default: 1000)
    /// - `RECONNECT_BASE_MS` / `RECONNECT_MAX_MS` / `RECONNECT_MAX_ATTEMPTS` (default: 1000 / 30000 / 10)
    /// - `RETRY_MAX_ATTEMPTS` / `RETRY_BASE_MS` / `RETRY_MAX_MS` / `RETRY_JITTER_MS` (default: 3 / 500 / 8000 / 250)
    /// - `NETWORK_RETRY_DELAY_MS` - delay before a recovery refetch (default: 2000)
    /// - `ERROR_LOG_CAPACITY` / `ERROR_LOG_WINDOW_SECS` (default: 100 / 3600)
    /// - `OUTBOUND_BUFFER` - realtime send buffer (default: 64)
    /// - `SESSION_PATH` - session marker file (default: .storefront_session.json)
    /// - `DIAGNOSTICS_PORT` - diagnostics HTTP port (default: 3000)
    /// - `MAINTENANCE_INTERVAL` - maintenance task interval in seconds (default: 60)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: env::var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            request_timeout_ms: env_or("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            default_stale_ms: env_or("DEFAULT_STALE_MS", defaults.default_stale_ms),
            max_entries: env_or("MAX_ENTRIES", defaults.max_entries),
            reconnect_base_ms: env_or("RECONNECT_BASE_MS", defaults.reconnect_base_ms),
            reconnect_max_ms: env_or("RECONNECT_MAX_MS", defaults.reconnect_max_ms),
            reconnect_max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", defaults.reconnect_max_attempts),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_base_ms: env_or("RETRY_BASE_MS", defaults.retry_base_ms),
            retry_max_ms: env_or("RETRY_MAX_MS", defaults.retry_max_ms),
            retry_jitter_ms: env_or("RETRY_JITTER_MS", defaults.retry_jitter_ms),
            network_retry_delay_ms: env_or("NETWORK_RETRY_DELAY_MS", defaults.network_retry_delay_ms),
            error_log_capacity: env_or("ERROR_LOG_CAPACITY", defaults.error_log_capacity),
            error_log_window_secs: env_or("ERROR_LOG_WINDOW_SECS", defaults.error_log_window_secs),
            outbound_buffer: env_or("OUTBOUND_BUFFER", defaults.outbound_buffer),
            session_path: env::var("SESSION_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_path),
            diagnostics_port: env_or("DIAGNOSTICS_PORT", defaults.diagnostics_port),
            maintenance_interval: env_or("MAINTENANCE_INTERVAL", defaults.maintenance_interval),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn network_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network_retry_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            ws_endpoint: "ws://localhost:8080/ws".to_string(),
            request_timeout_ms: 10_000,
            default_stale_ms: 30_000,
            max_entries: 1000,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 10,
            retry_max_attempts: 3,
            retry_base_ms: 500,
            retry_max_ms: 8000,
            retry_jitter_ms: 250,
            network_retry_delay_ms: 2000,
            error_log_capacity: 100,
            error_log_window_secs: 3600,
            outbound_buffer: 64,
            session_path: PathBuf::from(".storefront_session.json"),
            diagnostics_port: 3000,
            maintenance_interval: 60,
        }
    }
}
