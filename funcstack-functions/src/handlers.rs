//! HTTP handlers for function invocation

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request},
    response::Response,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use funcstack_core::{ErrorCode, FunctionsError};

use crate::dispatch::{error_response, Dispatcher};
use crate::event::{resolve_target, FunctionTarget, RequestAdapter};
use crate::registry::FunctionRegistry;

/// Shared state for the function handlers
pub struct FunctionsState {
    pub registry: Arc<FunctionRegistry>,
    pub adapter: RequestAdapter,
    pub dispatcher: Dispatcher,
}

impl FunctionsState {
    pub fn new(registry: Arc<FunctionRegistry>, adapter: RequestAdapter, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            adapter,
            dispatcher,
        }
    }
}

/// Router serving every function path. Requests that match no function get
/// a 404, so other routes should be merged in before this one is used as
/// the catch-all.
pub fn router(state: Arc<FunctionsState>) -> Router {
    Router::new().fallback(handle_function).with_state(state)
}

pub async fn handle_function(
    State(state): State<Arc<FunctionsState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let reject = |error: FunctionsError| error_response(&error, accept.as_deref());

    let target = resolve_target(&path, request.headers()).or_else(|| {
        state.registry.get_by_route(&path).map(|function| FunctionTarget {
            name: function.name().to_string(),
            route: Some(path.clone()),
            builder: false,
        })
    });
    let Some(target) = target else {
        debug!(path = %path, "No function matches path");
        return reject(FunctionsError::new(
            ErrorCode::FunctionNotFound,
            format!("No function matches {path}"),
        ));
    };

    let Some(function) = state.registry.get(&target.name) else {
        return reject(
            FunctionsError::new(
                ErrorCode::FunctionNotFound,
                format!("Function not found: {}", target.name),
            )
            .with_function(&target.name),
        );
    };

    if !function.has_valid_name() {
        warn!(function = %target.name, "Refusing to invoke function with invalid name");
        return reject(
            FunctionsError::new(
                ErrorCode::InvalidFunctionName,
                format!(
                    "Function name '{}' is invalid: use only letters, digits, '-' and '_'",
                    target.name
                ),
            )
            .with_function(&target.name),
        );
    }

    info!(
        function = %target.name,
        method = %request.method(),
        path = %path,
        "Invoking function"
    );

    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    let adapted = match state.adapter.to_event(request, remote, &target).await {
        Ok(adapted) => adapted,
        Err(e) => {
            warn!(function = %target.name, error = %e, "Could not adapt request");
            return reject(
                FunctionsError::new(ErrorCode::BadRequest, e.to_string()).with_function(&target.name),
            );
        }
    };

    state.dispatcher.dispatch(function, adapted, &target).await
}
