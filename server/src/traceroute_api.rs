//! Traceroute endpoints

use crate::api::{internal, not_found, ok, ApiResponse};
use crate::probe_log::ProbeKind;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/traceroutes", get(list_traceroutes))
        .route("/api/traceroutes/{traceroute_id}", get(get_traceroute))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_traceroutes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    let traceroutes = state
        .traceroutes
        .get_all_traceroutes(query.limit)
        .await
        .map_err(internal)?;
    let stats = state
        .probes
        .attempt_stats(ProbeKind::Traceroute)
        .await
        .map_err(internal)?;
    ok(json!({
        "count": traceroutes.len(),
        "traceroutes": traceroutes,
        "stats": stats,
    }))
}

async fn get_traceroute(
    State(state): State<AppState>,
    Path(traceroute_id): Path<i64>,
) -> ApiResponse {
    match state
        .traceroutes
        .get_traceroute(traceroute_id)
        .await
        .map_err(internal)?
    {
        Some(traceroute) => ok(json!({"traceroute": traceroute})),
        None => Err(not_found("Traceroute not found")),
    }
}
