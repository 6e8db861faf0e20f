//! Packet ingestion pipeline
//!
//! Consumes packet records from the radio driver, upserts node state,
//! appends bounded packet history, derives topology edges, and closes open
//! probe attempts when a traceroute or telemetry response arrives. Every
//! failure is recovered here; nothing propagates to the driver callback.

use crate::config::Config;
use crate::node_store::{NodeStore, NodeUpdate, PacketInsert};
use crate::probe_log::{ProbeLog, TelemetryResponseMeta};
use crate::radio::{DriverNode, RadioSlot};
use crate::relay::{RelayResolver, ResolvedRelay};
use crate::topology_store::TopologyStore;
use crate::traceroute_store::TracerouteStore;
use common::{num_to_id, DecodedPayload, PacketRecord, PortNum};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub struct Ingestor {
    nodes: Arc<NodeStore>,
    topology: Arc<TopologyStore>,
    traceroutes: Arc<TracerouteStore>,
    probes: Arc<ProbeLog>,
    resolver: RelayResolver,
    radio: Arc<RadioSlot>,
    config: Arc<Config>,
}

impl Ingestor {
    pub fn new(
        nodes: Arc<NodeStore>,
        topology: Arc<TopologyStore>,
        traceroutes: Arc<TracerouteStore>,
        probes: Arc<ProbeLog>,
        radio: Arc<RadioSlot>,
        config: Arc<Config>,
    ) -> Self {
        let resolver = RelayResolver::new(nodes.clone());
        Self {
            nodes,
            topology,
            traceroutes,
            probes,
            resolver,
            radio,
            config,
        }
    }

    /// Process one received packet. Individual step failures are logged and
    /// the remaining steps still run, so one bad write cannot wedge the
    /// pipeline.
    pub async fn handle_packet(&self, packet: &PacketRecord) {
        if !self.config.tracking.enabled {
            return;
        }

        // A record without a source identity is unusable.
        let Some(node_id) = packet.from_id.clone() else {
            tracing::debug!("Dropping packet without source identity");
            return;
        };

        let radio = self.radio.current();
        let driver_nodes = radio
            .as_ref()
            .map(|link| link.node_table())
            .unwrap_or_default();
        let local_node_id = radio.as_ref().and_then(|link| link.local_node_id());

        let node_update = extract_node_update(&node_id, packet, &driver_nodes);
        if let Err(e) = self.nodes.upsert_node(&node_update).await {
            tracing::warn!("Failed to upsert node {}: {}", node_id, e);
        }

        // Relay attribution happens once and feeds both the packet row and
        // the telemetry correlator.
        let hops_away = packet.hops_away();
        let resolved_relay = match (packet.relay_node, hops_away) {
            (Some(partial), Some(hops)) if hops > 0 => {
                self.resolver.resolve(partial, &node_id, &driver_nodes).await
            }
            _ => None,
        };

        let port = packet.port();
        if self.is_tracked(port) {
            let insert = extract_packet_insert(&node_id, packet, resolved_relay.as_ref());
            let cap = self.config.tracking.max_packets_per_node;
            if let Err(e) = self.nodes.insert_packet(&insert, cap).await {
                tracing::warn!("Failed to insert packet from {}: {}", node_id, e);
            }
        }

        if self.config.topology.enabled {
            self.update_topology(&node_id, packet, local_node_id.as_deref())
                .await;
        }

        match packet.decoded.as_ref() {
            Some(DecodedPayload::Traceroute { traceroute }) => {
                self.correlate_traceroute(&node_id, packet, traceroute, &driver_nodes)
                    .await;
            }
            Some(DecodedPayload::Telemetry { .. }) => {
                self.correlate_telemetry(&node_id, packet, resolved_relay)
                    .await;
            }
            _ => {}
        }
    }

    fn is_tracked(&self, port: Option<PortNum>) -> bool {
        let tracked = &self.config.tracking.track_packet_types;
        if tracked.is_empty() {
            return true;
        }
        match port {
            Some(port) => tracked.iter().any(|t| t == port.as_str()),
            None => false,
        }
    }

    /// Record the source reaching the local node.
    async fn update_topology(
        &self,
        node_id: &str,
        packet: &PacketRecord,
        local_node_id: Option<&str>,
    ) {
        let (Some(local_id), Some(hops)) = (local_node_id, packet.hops_away()) else {
            return;
        };
        if node_id == local_id {
            return;
        }
        if let Err(e) = self
            .topology
            .update_link(
                node_id,
                local_id,
                packet.rx_snr,
                packet.rx_rssi,
                Some(hops as i64),
            )
            .await
        {
            tracing::warn!("Failed to update topology for {}: {}", node_id, e);
        }
    }

    /// Traceroute responses: store the route, derive one topology edge per
    /// consecutive hop pair, and close the pending attempt toward the
    /// responder. Incomplete routes are stored as-is.
    async fn correlate_traceroute(
        &self,
        from_node_id: &str,
        packet: &PacketRecord,
        traceroute: &common::RouteDiscovery,
        driver_nodes: &[DriverNode],
    ) {
        let route_ids: Vec<String> = traceroute
            .route
            .iter()
            .map(|&num| {
                driver_nodes
                    .iter()
                    .find(|node| node.num == num)
                    .map(|node| node.canonical_id())
                    .unwrap_or_else(|| num_to_id(num))
            })
            .collect();

        // Each consecutive pair in the route is one observed hop.
        if route_ids.len() >= 2 {
            for (i, pair) in route_ids.windows(2).enumerate() {
                let snr = traceroute.snr_towards.get(i).copied();
                if let Err(e) = self
                    .topology
                    .update_link(&pair[0], &pair[1], snr, None, Some(1))
                    .await
                {
                    tracing::warn!("Failed to update traceroute hop topology: {}", e);
                }
            }
        }

        let snr_towards = if traceroute.snr_towards.is_empty() {
            None
        } else {
            Some(traceroute.snr_towards.as_slice())
        };

        let traceroute_id = match self
            .traceroutes
            .insert_traceroute(
                from_node_id,
                packet.to_id.as_deref(),
                &route_ids,
                snr_towards,
                packet.id.map(|id| id as i64),
            )
            .await
        {
            Ok(id) => {
                tracing::info!(
                    "Traceroute stored from {}: {} hops",
                    from_node_id,
                    route_ids.len()
                );
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Failed to insert traceroute from {}: {}", from_node_id, e);
                None
            }
        };

        // The response comes FROM the destination we probed.
        match self
            .probes
            .complete_traceroute_attempt(from_node_id, traceroute_id)
            .await
        {
            Ok(true) => tracing::info!("Traceroute attempt to {} completed", from_node_id),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to complete traceroute attempt: {}", e),
        }
    }

    /// Telemetry responses: close the pending attempt toward the responder,
    /// capturing signal quality and the resolved relay on the row.
    async fn correlate_telemetry(
        &self,
        from_node_id: &str,
        packet: &PacketRecord,
        resolved_relay: Option<ResolvedRelay>,
    ) {
        let meta = TelemetryResponseMeta {
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
            relay_node_id: resolved_relay.as_ref().map(|r| r.node_id.clone()),
            relay_node_name: resolved_relay.map(|r| r.name),
            hops_away: packet.hops_away().map(|h| h as i64),
        };

        match self
            .probes
            .complete_telemetry_attempt(from_node_id, &meta)
            .await
        {
            Ok(true) => tracing::info!(
                "Telemetry response from {} ({} hops, SNR {:?})",
                from_node_id,
                meta.hops_away.unwrap_or(0),
                meta.rx_snr
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to complete telemetry attempt: {}", e),
        }
    }
}

/// Merge node attributes from the driver's table and the packet payload.
/// Payload fields win over the driver table snapshot.
fn extract_node_update(
    node_id: &str,
    packet: &PacketRecord,
    driver_nodes: &[DriverNode],
) -> NodeUpdate {
    let mut update = NodeUpdate {
        node_id: node_id.to_string(),
        node_num: packet.from.map(|n| n as i64),
        is_mqtt: Some(packet.via_mqtt),
        ..Default::default()
    };

    if let Some(node) = driver_nodes
        .iter()
        .find(|node| node.canonical_id() == node_id)
    {
        update.short_name = node.short_name.clone();
        update.long_name = node.long_name.clone();
        update.hardware_model = node.hw_model.clone();
        update.latitude = node.latitude;
        update.longitude = node.longitude;
        update.altitude = node.altitude;
        update.battery_level = node.battery_level;
        update.voltage = node.voltage;
        // The driver table has no explicit charging flag; a node reporting
        // transmit air-time is awake and powered enough to be treated as
        // charging.
        if node.air_util_tx.is_some() {
            update.is_charging = Some(true);
        }
    }

    match packet.decoded.as_ref() {
        Some(DecodedPayload::NodeInfo { user }) => {
            update.short_name = user.short_name.clone().or(update.short_name);
            update.long_name = user.long_name.clone().or(update.long_name);
            update.hardware_model = user.hw_model.clone().or(update.hardware_model);
        }
        Some(DecodedPayload::Position { position }) => {
            update.latitude = position.latitude_deg().or(update.latitude);
            update.longitude = position.longitude_deg().or(update.longitude);
            update.altitude = position.altitude.or(update.altitude);
        }
        Some(DecodedPayload::Telemetry { telemetry }) => {
            if let Some(metrics) = telemetry.device_metrics.as_ref() {
                update.battery_level = metrics.battery_level.or(update.battery_level);
                update.voltage = metrics.voltage.or(update.voltage);
                if let Some(level) = metrics.battery_level {
                    // Firmware reports 101% while on external power.
                    update.is_powered = Some(level > 100);
                }
            }
        }
        _ => {}
    }

    update
}

/// Build the packet-history row for a tracked packet.
fn extract_packet_insert(
    node_id: &str,
    packet: &PacketRecord,
    resolved_relay: Option<&ResolvedRelay>,
) -> PacketInsert {
    let mut insert = PacketInsert {
        node_id: node_id.to_string(),
        packet_type: packet.port().map(|p| p.as_str().to_string()),
        channel_index: Some(packet.channel.unwrap_or(0) as i64),
        hop_start: packet.hop_start.map(|h| h as i64),
        hop_limit: packet.hop_limit.map(|h| h as i64),
        hops_away: packet.hops_away().map(|h| h as i64),
        via_mqtt: packet.via_mqtt,
        rx_snr: packet.rx_snr,
        rx_rssi: packet.rx_rssi,
        raw_packet: serde_json::to_string(packet).ok(),
        ..Default::default()
    };

    match (resolved_relay, packet.relay_node, packet.hops_away()) {
        (Some(relay), _, _) => {
            insert.relay_node_id = Some(relay.node_id.clone());
            insert.relay_node_name = Some(relay.name.clone());
        }
        // Unresolved relay on a multi-hop packet: keep the raw byte as a
        // decimal marker so a later pass could still attribute it.
        (None, Some(partial), Some(hops)) if hops > 0 => {
            insert.relay_node_id = Some(partial.to_string());
        }
        _ => {}
    }

    match packet.decoded.as_ref() {
        Some(DecodedPayload::TextMessage { text }) => {
            insert.message_text = text.clone();
        }
        Some(DecodedPayload::Position { position }) => {
            insert.latitude = position.latitude_deg();
            insert.longitude = position.longitude_deg();
            insert.altitude = position.altitude;
        }
        Some(DecodedPayload::Telemetry { telemetry }) => {
            if let Some(metrics) = telemetry.device_metrics.as_ref() {
                insert.battery_level = metrics.battery_level;
                insert.voltage = metrics.voltage;
            }
            if let Some(env) = telemetry.environment_metrics.as_ref() {
                insert.temperature = env.temperature;
                insert.humidity = env.relative_humidity;
                insert.pressure = env.barometric_pressure;
            }
        }
        Some(DecodedPayload::Traceroute { traceroute }) => {
            insert.message_text = Some(format!("Traceroute: {} hops", traceroute.route.len()));
        }
        _ => {}
    }

    insert
}

/// Channel carrying packets from the driver callback into the worker.
pub fn packet_channel() -> (
    mpsc::UnboundedSender<PacketRecord>,
    mpsc::UnboundedReceiver<PacketRecord>,
) {
    mpsc::unbounded_channel()
}

/// Worker loop draining the packet channel until shutdown (or the driver
/// side closing the channel).
pub async fn run_ingest_worker(
    ingestor: Arc<Ingestor>,
    mut packets: mpsc::UnboundedReceiver<PacketRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            maybe_packet = packets.recv() => {
                match maybe_packet {
                    Some(packet) => ingestor.handle_packet(&packet).await,
                    None => {
                        tracing::info!("Packet channel closed, ingest worker exiting");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Ingest worker shutting down");
                break;
            }
        }
    }
}
