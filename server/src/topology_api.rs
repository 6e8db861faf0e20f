//! Topology and statistics endpoints

use crate::api::{internal, ok, ApiResponse};
use crate::state::AppState;
use crate::views;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/topology", get(get_topology))
        .route("/api/topology/graph", get(get_topology_graph))
        .route("/api/topology/hop-graph", get(get_hop_graph))
        .route("/api/stats", get(get_stats))
}

#[derive(Deserialize)]
struct TopologyQuery {
    #[serde(default = "default_active_only")]
    active_only: bool,
}

fn default_active_only() -> bool {
    true
}

async fn get_topology(
    State(state): State<AppState>,
    Query(query): Query<TopologyQuery>,
) -> ApiResponse {
    let links = state
        .topology
        .get_topology(query.active_only)
        .await
        .map_err(internal)?;
    ok(json!({"count": links.len(), "links": links}))
}

async fn get_topology_graph(State(state): State<AppState>) -> ApiResponse {
    let graph = views::topology_graph(&state.nodes, &state.topology)
        .await
        .map_err(internal)?;
    ok(json!({"graph": graph}))
}

async fn get_hop_graph(State(state): State<AppState>) -> ApiResponse {
    let graph = views::hop_graph(&state.nodes).await.map_err(internal)?;
    ok(json!({"nodes": graph.nodes, "edges": graph.edges}))
}

async fn get_stats(State(state): State<AppState>) -> ApiResponse {
    let statistics = state.nodes.get_statistics().await.map_err(internal)?;
    ok(json!({"statistics": statistics}))
}
