//! API Router configuration

use super::websocket::ws_handler;
use crate::config::Config;
use crate::domain::number_registry::NumberRegistry;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// State shared by every connection
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Number statistics survive reconnects
    pub registry: Arc<dyn NumberRegistry>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<dyn NumberRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::number_registry::InMemoryNumberRegistry;
    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = build_router(AppState::new(Config::default(), Arc::new(InMemoryNumberRegistry::new())));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let app = build_router(AppState::new(Config::default(), Arc::new(InMemoryNumberRegistry::new())));

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
