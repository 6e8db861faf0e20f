//! Export, coverage-map, site-config, and send-text endpoints

use crate::api::{bad_request, failure, internal, ok, ApiResponse};
use crate::coverage;
use crate::state::AppState;
use crate::views;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/export/json", get(export_json))
        .route("/api/export/geojson", get(export_geojson))
        .route("/api/map-data", get(map_data))
        .route("/api/site-config", get(site_config))
        .route("/api/send-text", post(send_text))
}

async fn export_json(State(state): State<AppState>) -> ApiResponse {
    let export = views::full_export(&state.nodes, &state.topology)
        .await
        .map_err(internal)?;
    let value = serde_json::to_value(export).map_err(internal)?;
    Ok(Json(value))
}

async fn export_geojson(State(state): State<AppState>) -> ApiResponse {
    let geojson = views::nodes_geojson(&state.nodes).await.map_err(internal)?;
    Ok(Json(geojson))
}

#[derive(Deserialize)]
struct MapDataQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    coverage::DEFAULT_WINDOW_HOURS
}

/// A window longer than 30 days is a client bug, not a bigger map.
const MAX_WINDOW_HOURS: i64 = 720;

async fn map_data(State(state): State<AppState>, Query(query): Query<MapDataQuery>) -> ApiResponse {
    if query.hours <= 0 || query.hours > MAX_WINDOW_HOURS {
        return Err(bad_request(format!(
            "hours must be between 1 and {}",
            MAX_WINDOW_HOURS
        )));
    }

    let map = coverage::build_coverage_map(
        &state.nodes,
        &state.traceroutes,
        &state.probes,
        query.hours,
    )
    .await
    .map_err(internal)?;

    ok(json!({
        "nodes": map.nodes,
        "direct_connections": map.direct_connections,
        "indirect_coverage": map.indirect_coverage,
        "hop_distribution": map.hop_distribution,
        "stats": map.stats,
    }))
}

async fn site_config(State(state): State<AppState>) -> ApiResponse {
    ok(json!({"site_name": state.config.server.site_name}))
}

#[derive(Deserialize)]
struct SendTextRequest {
    text: String,
    /// Numeric destination; absent means broadcast.
    destination: Option<u32>,
    channel: Option<u32>,
}

async fn send_text(
    State(state): State<AppState>,
    Json(request): Json<SendTextRequest>,
) -> ApiResponse {
    if request.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }

    let Some(radio) = state.radio.current() else {
        return Err(failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "No radio interface connected",
        ));
    };

    let channel = request
        .channel
        .unwrap_or(state.config.server.default_channel);
    radio
        .send_text(request.destination, channel, &request.text)
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    ok(json!({"sent": true, "channel": channel}))
}
