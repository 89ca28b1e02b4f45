//! API Routes
//!
//! Configures the Axum router with the diagnostics endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    cache_handler, errors_handler, health_handler, invalidate_handler, realtime_retry_handler,
    stats_handler, AppState,
};

/// Creates the diagnostics router.
///
/// # Endpoints
/// - `GET /health` - Health check with realtime state
/// - `GET /stats` - Cache, realtime and mutation counters
/// - `GET /errors` - Classified errors inside the log window
/// - `GET /cache?prefix=` - Cached entries under a key prefix
/// - `POST /invalidate` - Mark a prefix stale, optionally refetching
/// - `POST /realtime/retry` - Restart reconnection after it gave up
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/errors", get(errors_handler))
        .route("/cache", get(cache_handler))
        .route("/invalidate", post(invalidate_handler))
        .route("/realtime/retry", post(realtime_retry_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use crate::backend::mock::MockBackend;
    use crate::config::Config;
    use crate::engine::SyncEngine;
    use crate::error::{Result, SyncError};
    use crate::keys::{self, EntityKind};
    use crate::realtime::{Connection, Connector};

    struct Offline;

    #[async_trait]
    impl Connector for Offline {
        async fn connect(&self) -> Result<Connection> {
            Err(SyncError::Channel("offline".into()))
        }
    }

    fn create_test_app() -> (Router, Arc<SyncEngine>) {
        let engine = SyncEngine::builder(Config::default())
            .backend(Arc::new(MockBackend::new()))
            .connector(Arc::new(Offline))
            .client_id("routes")
            .build()
            .unwrap();
        let engine = Arc::new(engine);
        (create_router(AppState::new(engine.clone())), engine)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["connection"], "disconnected");
    }

    #[tokio::test]
    async fn test_cache_endpoint_filters_by_prefix() {
        let (app, engine) = create_test_app();
        engine
            .store()
            .set(keys::detail(EntityKind::Product, "1"), json!({"id": "1"}));
        engine
            .store()
            .set(keys::detail(EntityKind::Order, "9"), json!({"id": "9"}));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/cache?prefix=products")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["value"]["id"], "1");
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_marks_stale() {
        let (app, engine) = create_test_app();
        let key = keys::detail(EntityKind::Coupon, "c1");
        engine.store().set(key.clone(), json!({"id": "c1"}));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/invalidate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prefix":"coupons"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["invalidated"], 1);
        assert!(engine.get(&key).unwrap().fetched_at.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_rejects_empty_prefix() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/invalidate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prefix":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_errors_endpoint_lists_reported_failures() {
        let (app, engine) = create_test_app();
        let _ = engine
            .ensure_fresh::<Value>(&keys::detail(EntityKind::Product, "missing"))
            .await;

        let response = app
            .oneshot(Request::builder().uri("/errors").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["errors"][0]["kind"], "client");
    }

    #[tokio::test]
    async fn test_stats_and_retry_endpoints() {
        let (app, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["pending_mutations"], 0);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/realtime/retry")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["failed_reconnects"].is_u64());
    }
}
