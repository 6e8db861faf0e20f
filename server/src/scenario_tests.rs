//! End-to-end flows across the ingest pipeline, schedulers, and views.

use crate::config::Config;
use crate::coverage::build_coverage_map;
use crate::database::init_database;
use crate::ingest::Ingestor;
use crate::node_store::NodeStore;
use crate::probe_log::{ProbeKind, ProbeLog};
use crate::radio::tests::MockRadio;
use crate::radio::{DriverNode, RadioSlot};
use crate::topology_store::TopologyStore;
use crate::traceroute_store::TracerouteStore;
use crate::views;
use common::{DecodedPayload, PacketRecord, PositionInfo, RouteDiscovery};
use std::sync::Arc;
use tempfile::NamedTempFile;

struct World {
    ingestor: Ingestor,
    nodes: Arc<NodeStore>,
    topology: Arc<TopologyStore>,
    traceroutes: Arc<TracerouteStore>,
    probes: Arc<ProbeLog>,
    radio: Arc<RadioSlot>,
    _db_file: NamedTempFile,
}

fn world() -> World {
    let db_file = NamedTempFile::new().unwrap();
    let db = init_database(db_file.path()).unwrap();
    let nodes = Arc::new(NodeStore::new(db.clone()));
    let topology = Arc::new(TopologyStore::new(db.clone()));
    let traceroutes = Arc::new(TracerouteStore::new(db.clone()));
    let probes = Arc::new(ProbeLog::new(db));
    let radio = Arc::new(RadioSlot::new());
    let ingestor = Ingestor::new(
        nodes.clone(),
        topology.clone(),
        traceroutes.clone(),
        probes.clone(),
        radio.clone(),
        Arc::new(Config::default()),
    );
    World {
        ingestor,
        nodes,
        topology,
        traceroutes,
        probes,
        radio,
        _db_file: db_file,
    }
}

fn position_packet(from_id: &str, from: u32, lat: f64, lon: f64) -> PacketRecord {
    PacketRecord {
        from: Some(from),
        from_id: Some(from_id.to_string()),
        hop_start: Some(3),
        hop_limit: Some(3),
        decoded: Some(DecodedPayload::Position {
            position: PositionInfo {
                latitude: Some(lat),
                longitude: Some(lon),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// A relayed packet flows from ingest through relay attribution into the
/// coverage map's indirect tier for the relay.
#[tokio::test]
async fn relayed_packet_reaches_coverage_tier() {
    let w = world();
    w.radio.connect(Arc::new(MockRadio {
        local_id: Some("!deadbeef".to_string()),
        nodes: vec![DriverNode {
            num: 0xaabbccdd,
            long_name: Some("Hilltop".to_string()),
            last_heard: Some(5000),
            snr: Some(8.0),
            ..Default::default()
        }],
        ..Default::default()
    }));

    // Both endpoints need positions to appear on the map.
    w.ingestor
        .handle_packet(&position_packet("!11111111", 0x11111111, 37.1, -122.1))
        .await;
    w.ingestor
        .handle_packet(&position_packet("!aabbccdd", 0xaabbccdd, 37.2, -122.2))
        .await;

    // Two hops away, relayed through the node ending in 0xdd.
    let packet = PacketRecord {
        from: Some(0x11111111),
        from_id: Some("!11111111".to_string()),
        hop_start: Some(3),
        hop_limit: Some(1),
        rx_snr: Some(2.0),
        rx_rssi: Some(-95),
        relay_node: Some(0xdd),
        decoded: Some(DecodedPayload::TextMessage {
            text: Some("over the hill".to_string()),
        }),
        ..Default::default()
    };
    w.ingestor.handle_packet(&packet).await;

    let map = build_coverage_map(&w.nodes, &w.traceroutes, &w.probes, 24)
        .await
        .unwrap();
    let entry = map
        .indirect_coverage
        .iter()
        .find(|c| c.relay_node_id == "!aabbccdd")
        .expect("relay credited with indirect coverage");
    assert_eq!(entry.tiers["2"], vec!["!11111111"]);
}

/// A traceroute response closes the pending attempt, builds per-hop edges,
/// and its pairs show up as direct links on the coverage map.
#[tokio::test]
async fn traceroute_response_closes_attempt_and_maps_links() {
    let w = world();

    w.ingestor
        .handle_packet(&position_packet("!11111111", 0x11111111, 37.1, -122.1))
        .await;
    w.ingestor
        .handle_packet(&position_packet("!33333333", 0x33333333, 37.2, -122.2))
        .await;
    w.ingestor
        .handle_packet(&position_packet("!22222222", 0x22222222, 37.3, -122.3))
        .await;

    w.probes
        .insert_attempt(ProbeKind::Traceroute, "!22222222", None)
        .await
        .unwrap();

    let response = PacketRecord {
        from: Some(0x22222222),
        from_id: Some("!22222222".to_string()),
        decoded: Some(DecodedPayload::Traceroute {
            traceroute: RouteDiscovery {
                route: vec![0x11111111, 0x33333333, 0x22222222],
                snr_towards: vec![5.0, 3.0],
            },
        }),
        ..Default::default()
    };
    w.ingestor.handle_packet(&response).await;

    // Attempt closed.
    let completed = w
        .probes
        .get_attempts(ProbeKind::Traceroute, 10, Some("completed"))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);

    // Hop-graph and topology both know the intermediate edges.
    assert_eq!(w.topology.get_topology(true).await.unwrap().len(), 2);

    let map = build_coverage_map(&w.nodes, &w.traceroutes, &w.probes, 24)
        .await
        .unwrap();
    assert_eq!(map.direct_connections.len(), 2);
    assert!(map
        .direct_connections
        .iter()
        .all(|link| link.source == "traceroute"));
}

/// Packets delivered through the driver-facing channel reach the store via
/// the ingest worker, the way a connected radio would feed them.
#[tokio::test]
async fn packet_channel_feeds_ingest_worker() {
    use crate::ingest::run_ingest_worker;
    use crate::state::AppState;
    use tokio::sync::broadcast;

    let db_file = NamedTempFile::new().unwrap();
    let db = init_database(db_file.path()).unwrap();
    let (state, packet_receiver) = AppState::new(db, Arc::new(Config::default()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let worker = tokio::spawn(run_ingest_worker(
        Arc::new(state.ingestor()),
        packet_receiver,
        shutdown_tx.subscribe(),
    ));

    state
        .packet_sender
        .send(PacketRecord {
            from: Some(0x11111111),
            from_id: Some("!11111111".to_string()),
            decoded: Some(DecodedPayload::TextMessage {
                text: Some("hello mesh".to_string()),
            }),
            ..Default::default()
        })
        .unwrap();

    // Closing the sender drains the channel and ends the worker.
    drop(state.packet_sender);
    worker.await.unwrap();

    let node = state.nodes.get_node("!11111111").await.unwrap().unwrap();
    assert_eq!(node.total_packets_received, 1);
    let packets = state.nodes.get_node_packets("!11111111", 10).await.unwrap();
    assert_eq!(packets[0].message_text.as_deref(), Some("hello mesh"));
}

/// The hop-graph places direct nodes under LOCAL_NODE and relayed nodes
/// under their resolved relay.
#[tokio::test]
async fn hop_graph_reflects_ingested_traffic() {
    let w = world();
    w.radio.connect(Arc::new(MockRadio {
        local_id: Some("!deadbeef".to_string()),
        nodes: vec![DriverNode {
            num: 0xaabbccdd,
            last_heard: Some(5000),
            ..Default::default()
        }],
        ..Default::default()
    }));

    // Direct node.
    let direct = PacketRecord {
        from: Some(0x11111111),
        from_id: Some("!11111111".to_string()),
        hop_start: Some(3),
        hop_limit: Some(3),
        decoded: Some(DecodedPayload::TextMessage {
            text: Some("direct".to_string()),
        }),
        ..Default::default()
    };
    w.ingestor.handle_packet(&direct).await;

    // Relayed node.
    let relayed = PacketRecord {
        from: Some(0x22222222),
        from_id: Some("!22222222".to_string()),
        hop_start: Some(3),
        hop_limit: Some(2),
        relay_node: Some(0xdd),
        decoded: Some(DecodedPayload::TextMessage {
            text: Some("relayed".to_string()),
        }),
        ..Default::default()
    };
    w.ingestor.handle_packet(&relayed).await;

    let graph = views::hop_graph(&w.nodes).await.unwrap();

    let direct_edge = graph.edges.iter().find(|e| e.to == "!11111111").unwrap();
    assert_eq!(direct_edge.from, views::LOCAL_NODE_ID);

    let relayed_edge = graph.edges.iter().find(|e| e.to == "!22222222").unwrap();
    assert_eq!(relayed_edge.from, "!aabbccdd");
    assert_eq!(relayed_edge.hops, 1);
}
