//! HTTP router for funcstack

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use funcstack_functions::{FunctionRegistry, FunctionsState};

/// Create the main application router
pub fn create_router(functions: Arc<FunctionsState>) -> Router {
    let registry = functions.registry.clone();

    Router::new()
        .route("/health", get(health_check))
        .with_state(registry)
        // Everything else is a function request
        .merge(funcstack_functions::router(functions))
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(registry): State<Arc<FunctionRegistry>>) -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "functions": registry.list().len(),
    }))
}
