//! HTTP route table of the worker.

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{enqueue, scan};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/vulncheck/enqueue", post(enqueue::handle_enqueue))
        .route("/vulncheck/enqueue-all", post(enqueue::handle_enqueue_all))
        .route("/vulncheck/scan/{*module}", post(scan::handle_scan))
        .route(
            "/test-vulncheck-sandbox/{*module}",
            post(scan::handle_test_sandbox),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
