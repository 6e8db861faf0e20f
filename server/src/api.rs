//! HTTP API plumbing
//!
//! Envelope helpers shared by the endpoint modules and the router that
//! assembles them. Every JSON response carries `success`; failures add an
//! `error` message and map to 400/404/500.

use crate::state::AppState;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::fmt::Display;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResponse = Result<Json<Value>, ApiError>;

/// Wrap a payload object in the success envelope.
pub fn ok(payload: Value) -> ApiResponse {
    let mut body = json!({"success": true});
    if let (Some(body_map), Value::Object(extra)) = (body.as_object_mut(), payload) {
        for (key, value) in extra {
            body_map.insert(key, value);
        }
    }
    Ok(Json(body))
}

pub fn failure(status: StatusCode, message: impl Display) -> ApiError {
    (
        status,
        Json(json!({"success": false, "error": message.to_string()})),
    )
}

/// Store failures surface as 500 after being logged; the handler itself
/// stays oblivious to what went wrong.
pub fn internal(e: impl Display) -> ApiError {
    tracing::error!("Request failed: {}", e);
    failure(StatusCode::INTERNAL_SERVER_ERROR, e)
}

pub fn not_found(message: impl Display) -> ApiError {
    failure(StatusCode::NOT_FOUND, message)
}

pub fn bad_request(message: impl Display) -> ApiError {
    failure(StatusCode::BAD_REQUEST, message)
}

/// The read-oriented query surface plus the static web pages.
pub fn build_router(state: AppState) -> axum::Router {
    let web_dir = state.config.server.web_dir.clone();

    axum::Router::new()
        .merge(crate::nodes_api::routes())
        .merge(crate::topology_api::routes())
        .merge(crate::traceroute_api::routes())
        .merge(crate::telemetry_api::routes())
        .merge(crate::export_api::routes())
        .with_state(state)
        .fallback_service(tower_http::services::ServeDir::new(web_dir))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
