//! API Handlers
//!
//! HTTP request handlers for each diagnostics endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use tracing::info;

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::models::{
    CacheEntriesResponse, CacheQuery, ErrorsResponse, HealthResponse, InvalidateRequest,
    InvalidateResponse, RealtimeResponse, StatsResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.engine.connection_state()))
}

/// Handler for GET /stats
///
/// Cache counters plus the realtime, mutation and error log gauges.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let engine = &state.engine;
    Json(StatsResponse::new(
        engine.stats(),
        engine.connection_state(),
        engine.realtime().failed_attempts(),
        engine.pending_mutations(),
        engine.recent_errors().len(),
    ))
}

/// Handler for GET /errors
pub async fn errors_handler(State(state): State<AppState>) -> Json<ErrorsResponse> {
    Json(ErrorsResponse::new(state.engine.recent_errors()))
}

/// Handler for GET /cache?prefix=
pub async fn cache_handler(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Json<CacheEntriesResponse> {
    let prefix = query.key();
    let entries = state.engine.store().entries(&prefix);
    Json(CacheEntriesResponse::new(prefix.to_string(), entries))
}

/// Handler for POST /invalidate
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(SyncError::InvalidRequest(error_msg));
    }

    let invalidated = state.engine.invalidate(&req.key(), req.refetch);
    info!(prefix = %req.prefix, invalidated, refetch = req.refetch, "Manual invalidation");

    Ok(Json(InvalidateResponse {
        prefix: req.prefix,
        invalidated,
        refetch: req.refetch,
    }))
}

/// Handler for POST /realtime/retry
///
/// Resets the reconnect counter and wakes a channel that gave up.
pub async fn realtime_retry_handler(State(state): State<AppState>) -> Json<RealtimeResponse> {
    state.engine.retry_realtime();
    Json(RealtimeResponse {
        connection: state.engine.connection_state(),
        failed_reconnects: state.engine.realtime().failed_attempts(),
    })
}
