//! Node endpoints
//!
//! Listing, detail, per-node packet history, neighbors, per-node
//! traceroutes, and the operator ignore toggle.

use crate::api::{bad_request, internal, not_found, ok, ApiResponse};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{node_id}", get(get_node))
        .route("/api/nodes/{node_id}/packets", get(get_node_packets))
        .route("/api/nodes/{node_id}/neighbors", get(get_node_neighbors))
        .route("/api/nodes/{node_id}/traceroutes", get(get_node_traceroutes))
        .route(
            "/api/nodes/{node_id}/ignore",
            post(ignore_node).delete(unignore_node),
        )
}

async fn list_nodes(State(state): State<AppState>) -> ApiResponse {
    let nodes = state.nodes.get_all_nodes().await.map_err(internal)?;
    ok(json!({"count": nodes.len(), "nodes": nodes}))
}

async fn get_node(State(state): State<AppState>, Path(node_id): Path<String>) -> ApiResponse {
    match state.nodes.get_node(&node_id).await.map_err(internal)? {
        Some(node) => ok(json!({"node": node})),
        None => Err(not_found("Node not found")),
    }
}

#[derive(Deserialize)]
struct PacketsQuery {
    #[serde(default = "default_packet_limit")]
    limit: usize,
}

fn default_packet_limit() -> usize {
    100
}

async fn get_node_packets(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<PacketsQuery>,
) -> ApiResponse {
    if query.limit == 0 {
        return Err(bad_request("limit must be positive"));
    }
    let packets = state
        .nodes
        .get_node_packets(&node_id, query.limit)
        .await
        .map_err(internal)?;
    ok(json!({"count": packets.len(), "packets": packets}))
}

async fn get_node_neighbors(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResponse {
    let neighbors = state
        .topology
        .get_neighbors(&node_id)
        .await
        .map_err(internal)?;
    ok(json!({"count": neighbors.len(), "neighbors": neighbors}))
}

#[derive(Deserialize)]
struct NodeTraceroutesQuery {
    #[serde(default = "default_traceroute_limit")]
    limit: usize,
}

fn default_traceroute_limit() -> usize {
    50
}

async fn get_node_traceroutes(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<NodeTraceroutesQuery>,
) -> ApiResponse {
    let traceroutes = state
        .traceroutes
        .get_traceroutes_by_node(&node_id, query.limit)
        .await
        .map_err(internal)?;
    ok(json!({"count": traceroutes.len(), "traceroutes": traceroutes}))
}

async fn ignore_node(State(state): State<AppState>, Path(node_id): Path<String>) -> ApiResponse {
    set_ignored(&state, &node_id, true).await
}

async fn unignore_node(State(state): State<AppState>, Path(node_id): Path<String>) -> ApiResponse {
    set_ignored(&state, &node_id, false).await
}

async fn set_ignored(state: &AppState, node_id: &str, ignored: bool) -> ApiResponse {
    let changed = state
        .nodes
        .set_node_ignored(node_id, ignored)
        .await
        .map_err(internal)?;
    if !changed {
        return Err(not_found("Node not found"));
    }
    ok(json!({"node_id": node_id, "is_ignored": ignored}))
}
