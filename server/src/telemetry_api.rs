//! Telemetry attempt endpoints

use crate::api::{internal, ok, ApiResponse};
use crate::probe_log::ProbeKind;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/telemetry-requests", get(list_telemetry_requests))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    status: Option<String>,
}

fn default_limit() -> usize {
    100
}

async fn list_telemetry_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    // "all" means no filter, like the status dropdown sends it.
    let status = query
        .status
        .as_deref()
        .filter(|status| *status != "all");

    let requests = state
        .probes
        .get_attempts(ProbeKind::Telemetry, query.limit, status)
        .await
        .map_err(internal)?;
    let stats = state
        .probes
        .attempt_stats(ProbeKind::Telemetry)
        .await
        .map_err(internal)?;

    ok(json!({"requests": requests, "stats": stats}))
}
