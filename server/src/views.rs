//! Derived read models
//!
//! Pure functions over the store: the hop-graph, the topology graph, the
//! GeoJSON export, and the full JSON export. Nothing here mutates state.

use crate::database::{now_ms, StoreResult};
use crate::node_store::{NodeRow, NodeStore, PacketRow};
use crate::topology_store::{LinkRow, TopologyStore};
use common::is_full_id;
use serde::Serialize;

/// Synthetic identity representing the locally attached radio in the
/// hop-graph.
pub const LOCAL_NODE_ID: &str = "LOCAL_NODE";

/// Packets examined per node when deriving hop distance.
const HOP_SAMPLE_PACKETS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct HopGraphNode {
    pub id: String,
    pub label: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    /// Minimum observed hops-away; -1 for the local node, 99 when unknown.
    pub hops: i64,
    pub battery: Option<i64>,
    pub last_seen: Option<i64>,
    pub relay_via: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HopGraphEdge {
    pub from: String,
    pub to: String,
    pub hops: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HopGraph {
    pub nodes: Vec<HopGraphNode>,
    pub edges: Vec<HopGraphEdge>,
}

/// Hop-graph: every node hangs off either the local node (heard direct) or
/// the relay that most recently forwarded for it. Unresolved partial relay
/// markers produce no edge.
pub async fn hop_graph(nodes: &NodeStore) -> StoreResult<HopGraph> {
    let all_nodes = nodes.get_all_nodes().await?;

    let mut graph_nodes = vec![HopGraphNode {
        id: LOCAL_NODE_ID.to_string(),
        label: "Self (This Device)".to_string(),
        short_name: Some("Self".to_string()),
        long_name: Some("Self (This Device)".to_string()),
        hops: -1,
        battery: None,
        last_seen: None,
        relay_via: None,
    }];
    let mut graph_edges = Vec::new();

    for node in all_nodes {
        let packets = nodes
            .get_node_packets(&node.node_id, HOP_SAMPLE_PACKETS)
            .await?;

        let mut min_hops: Option<i64> = None;
        let mut relay_via: Option<String> = None;
        for packet in &packets {
            if let Some(hops) = packet.hops_away {
                min_hops = Some(min_hops.map_or(hops, |m| m.min(hops)));
                // Relay comes from the most recent packet that actually was
                // relayed, not from the minimum-hop packet.
                if hops > 0 && relay_via.is_none() {
                    relay_via = packet.relay_node_id.clone();
                }
            }
        }

        graph_nodes.push(HopGraphNode {
            id: node.node_id.clone(),
            label: node.display_name().to_string(),
            short_name: node.short_name.clone(),
            long_name: node.long_name.clone(),
            hops: min_hops.unwrap_or(99),
            battery: node.battery_level,
            last_seen: Some(node.last_seen_utc),
            relay_via: relay_via.clone(),
        });

        match (min_hops, relay_via) {
            (Some(0), _) => graph_edges.push(HopGraphEdge {
                from: LOCAL_NODE_ID.to_string(),
                to: node.node_id,
                hops: 0,
            }),
            (Some(hops), Some(relay)) if hops > 0 && is_full_id(&relay) => {
                graph_edges.push(HopGraphEdge {
                    from: relay,
                    to: node.node_id,
                    hops,
                })
            }
            _ => {}
        }
    }

    Ok(HopGraph {
        nodes: graph_nodes,
        edges: graph_edges,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyGraphNode {
    pub id: String,
    pub label: String,
    pub battery: Option<i64>,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyGraphEdge {
    pub source: String,
    pub target: String,
    pub quality: Option<f64>,
    pub snr: Option<f64>,
    pub rssi: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyGraph {
    pub nodes: Vec<TopologyGraphNode>,
    pub edges: Vec<TopologyGraphEdge>,
}

/// Topology in graph-rendering form: all nodes, active edges.
pub async fn topology_graph(
    nodes: &NodeStore,
    topology: &TopologyStore,
) -> StoreResult<TopologyGraph> {
    let all_nodes = nodes.get_all_nodes().await?;
    let links = topology.get_topology(true).await?;

    Ok(TopologyGraph {
        nodes: all_nodes
            .iter()
            .map(|node| TopologyGraphNode {
                id: node.node_id.clone(),
                label: node.display_name().to_string(),
                battery: node.battery_level,
                last_seen: node.last_seen_utc,
            })
            .collect(),
        edges: links
            .into_iter()
            .map(|link| TopologyGraphEdge {
                source: link.source_node_id,
                target: link.neighbor_node_id,
                quality: link.link_quality_score,
                snr: link.avg_snr,
                rssi: link.avg_rssi,
            })
            .collect(),
    })
}

/// GeoJSON FeatureCollection of positioned, non-ignored nodes.
pub async fn nodes_geojson(nodes: &NodeStore) -> StoreResult<serde_json::Value> {
    let all_nodes = nodes.get_all_nodes().await?;

    let features: Vec<serde_json::Value> = all_nodes
        .iter()
        .filter(|node| !node.is_ignored)
        .filter_map(|node| {
            let (lat, lon) = (node.latitude?, node.longitude?);
            Some(serde_json::json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [lon, lat],
                },
                "properties": {
                    "id": node.node_id,
                    "name": node.display_name(),
                    "short_name": node.short_name,
                    "altitude": node.altitude,
                    "battery": node.battery_level,
                    "hardware_model": node.hardware_model,
                    "last_seen": node.last_seen_utc,
                    "total_packets": node.total_packets_received,
                },
            }))
        })
        .collect();

    Ok(serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

/// Recent packets bundled per node in the full export.
const EXPORT_PACKETS_PER_NODE: usize = 50;

#[derive(Debug, Serialize)]
pub struct NodeExport {
    #[serde(flatten)]
    pub node: NodeRow,
    pub recent_packets: Vec<PacketRow>,
}

#[derive(Debug, Serialize)]
pub struct FullExport {
    pub generated_at_utc: i64,
    pub nodes: Vec<NodeExport>,
    pub topology: Vec<LinkRow>,
}

/// The whole model in one document: nodes with recent history plus active
/// topology.
pub async fn full_export(nodes: &NodeStore, topology: &TopologyStore) -> StoreResult<FullExport> {
    let all_nodes = nodes.get_all_nodes().await?;
    let mut exports = Vec::with_capacity(all_nodes.len());
    for node in all_nodes {
        let recent_packets = nodes
            .get_node_packets(&node.node_id, EXPORT_PACKETS_PER_NODE)
            .await?;
        exports.push(NodeExport {
            node,
            recent_packets,
        });
    }

    Ok(FullExport {
        generated_at_utc: now_ms(),
        nodes: exports,
        topology: topology.get_topology(true).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use crate::node_store::{NodeUpdate, PacketInsert};
    use tempfile::NamedTempFile;

    async fn seed(
        nodes: &NodeStore,
        node_id: &str,
        packets: Vec<(Option<i64>, Option<&str>)>,
    ) {
        nodes
            .upsert_node(&NodeUpdate {
                node_id: node_id.to_string(),
                node_num: common::id_to_num(node_id).map(|n| n as i64),
                ..Default::default()
            })
            .await
            .unwrap();
        for (hops_away, relay) in packets {
            nodes
                .insert_packet(
                    &PacketInsert {
                        node_id: node_id.to_string(),
                        hops_away,
                        relay_node_id: relay.map(str::to_string),
                        ..Default::default()
                    },
                    100,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_hop_graph_direct_and_relayed() {
        let db_file = NamedTempFile::new().unwrap();
        let db = init_database(db_file.path()).unwrap();
        let nodes = NodeStore::new(db);

        seed(&nodes, "!11111111", vec![(Some(0), None)]).await;
        seed(&nodes, "!22222222", vec![(Some(2), Some("!aabbccdd"))]).await;

        let graph = hop_graph(&nodes).await.unwrap();

        let local = graph.nodes.iter().find(|n| n.id == LOCAL_NODE_ID).unwrap();
        assert_eq!(local.hops, -1);

        let direct_edge = graph
            .edges
            .iter()
            .find(|e| e.to == "!11111111")
            .unwrap();
        assert_eq!(direct_edge.from, LOCAL_NODE_ID);
        assert_eq!(direct_edge.hops, 0);

        let relayed_edge = graph
            .edges
            .iter()
            .find(|e| e.to == "!22222222")
            .unwrap();
        assert_eq!(relayed_edge.from, "!aabbccdd");
        assert_eq!(relayed_edge.hops, 2);
    }

    #[tokio::test]
    async fn test_hop_graph_skips_partial_relay_markers() {
        let db_file = NamedTempFile::new().unwrap();
        let db = init_database(db_file.path()).unwrap();
        let nodes = NodeStore::new(db);

        // Only relay evidence is an unresolved decimal marker.
        seed(&nodes, "!22222222", vec![(Some(2), Some("221"))]).await;

        let graph = hop_graph(&nodes).await.unwrap();
        assert!(graph.edges.is_empty());
        // The node still appears, with its hop count.
        let node = graph.nodes.iter().find(|n| n.id == "!22222222").unwrap();
        assert_eq!(node.hops, 2);
    }

    #[tokio::test]
    async fn test_hop_graph_min_hops_with_mixed_packets() {
        let db_file = NamedTempFile::new().unwrap();
        let db = init_database(db_file.path()).unwrap();
        let nodes = NodeStore::new(db);

        // Heard both relayed and direct: direct wins for placement.
        seed(
            &nodes,
            "!33333333",
            vec![(Some(2), Some("!aabbccdd")), (Some(0), None)],
        )
        .await;

        let graph = hop_graph(&nodes).await.unwrap();
        let edge = graph.edges.iter().find(|e| e.to == "!33333333").unwrap();
        assert_eq!(edge.from, LOCAL_NODE_ID);
        assert_eq!(edge.hops, 0);
    }

    #[tokio::test]
    async fn test_geojson_excludes_unpositioned_and_ignored() {
        let db_file = NamedTempFile::new().unwrap();
        let db = init_database(db_file.path()).unwrap();
        let nodes = NodeStore::new(db);

        nodes
            .upsert_node(&NodeUpdate {
                node_id: "!11111111".to_string(),
                latitude: Some(37.5),
                longitude: Some(-122.0),
                ..Default::default()
            })
            .await
            .unwrap();
        nodes
            .upsert_node(&NodeUpdate {
                node_id: "!22222222".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        nodes
            .upsert_node(&NodeUpdate {
                node_id: "!33333333".to_string(),
                latitude: Some(38.0),
                longitude: Some(-121.0),
                ..Default::default()
            })
            .await
            .unwrap();
        nodes.set_node_ignored("!33333333", true).await.unwrap();

        let geojson = nodes_geojson(&nodes).await.unwrap();
        let features = geojson["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["id"], "!11111111");
        // GeoJSON wants [lon, lat].
        assert_eq!(features[0]["geometry"]["coordinates"][0], -122.0);
    }
}
