//! Response DTOs for the diagnostics API

use serde::Serialize;

use crate::cache::{CacheEntry, CacheStats};
use crate::realtime::ConnectionState;
use crate::recovery::ClassifiedError;

/// Response body for GET /health
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Realtime channel state
    pub connection: ConnectionState,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    pub fn healthy(connection: ConnectionState) -> Self {
        Self {
            status: "healthy".to_string(),
            connection,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Response body for GET /stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub cache: CacheStats,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
    pub connection: ConnectionState,
    /// Consecutive failed reconnect attempts
    pub failed_reconnects: u32,
    pub pending_mutations: usize,
    /// Classified errors inside the log window
    pub recent_errors: usize,
}

impl StatsResponse {
    pub fn new(
        cache: CacheStats,
        connection: ConnectionState,
        failed_reconnects: u32,
        pending_mutations: usize,
        recent_errors: usize,
    ) -> Self {
        Self {
            hit_rate: cache.hit_rate(),
            cache,
            connection,
            failed_reconnects,
            pending_mutations,
            recent_errors,
        }
    }
}

/// Response body for GET /errors, newest first
#[derive(Debug, Clone, Serialize)]
pub struct ErrorsResponse {
    pub count: usize,
    pub errors: Vec<ClassifiedError>,
}

impl ErrorsResponse {
    pub fn new(mut errors: Vec<ClassifiedError>) -> Self {
        errors.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Self {
            count: errors.len(),
            errors,
        }
    }
}

/// Response body for GET /cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntriesResponse {
    pub prefix: String,
    pub count: usize,
    pub entries: Vec<CacheEntry>,
}

impl CacheEntriesResponse {
    pub fn new(prefix: impl Into<String>, entries: Vec<CacheEntry>) -> Self {
        Self {
            prefix: prefix.into(),
            count: entries.len(),
            entries,
        }
    }
}

/// Response body for POST /invalidate
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub prefix: String,
    pub invalidated: usize,
    pub refetch: bool,
}

/// Response body for POST /realtime/retry
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeResponse {
    pub connection: ConnectionState,
    pub failed_reconnects: u32,
}
