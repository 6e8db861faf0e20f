//! Federated snapshot uploader
//!
//! Periodically exports recent observer state (nodes, packet history,
//! active topology, traceroutes) as one JSON document and posts it to the
//! configured collector endpoint. Upload failures are logged and dropped;
//! no core state depends on the collector being reachable.

use crate::config::FederationConfig;
use crate::database::{now_ms, StoreResult};
use crate::node_store::{NodeRow, NodeStore, PacketRow};
use crate::topology_store::{LinkRow, TopologyStore};
use crate::traceroute_store::{TracerouteRow, TracerouteStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Document schema version sent with every upload.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
pub struct FederatedSnapshot {
    pub schema_version: u32,
    pub collector_id: String,
    pub generated_at_utc: i64,
    pub nodes: Vec<NodeRow>,
    pub packets: Vec<PacketRow>,
    pub topology: Vec<LinkRow>,
    pub traceroutes: Vec<TracerouteRow>,
}

impl FederatedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.packets.is_empty()
            && self.topology.is_empty()
            && self.traceroutes.is_empty()
    }
}

pub struct FederatedUploader {
    nodes: Arc<NodeStore>,
    topology: Arc<TopologyStore>,
    traceroutes: Arc<TracerouteStore>,
    config: FederationConfig,
    client: reqwest::Client,
}

impl FederatedUploader {
    pub fn new(
        nodes: Arc<NodeStore>,
        topology: Arc<TopologyStore>,
        traceroutes: Arc<TracerouteStore>,
        config: FederationConfig,
    ) -> Self {
        Self {
            nodes,
            topology,
            traceroutes,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Collect everything observed since the configured lookback.
    pub async fn build_snapshot(&self) -> StoreResult<FederatedSnapshot> {
        let cutoff = now_ms() - self.config.export_hours_lookback * 60 * 60 * 1000;

        let nodes: Vec<NodeRow> = self
            .nodes
            .get_all_nodes()
            .await?
            .into_iter()
            .filter(|node| node.last_seen_utc >= cutoff)
            .collect();

        Ok(FederatedSnapshot {
            schema_version: SCHEMA_VERSION,
            collector_id: self.config.collector_id.clone(),
            generated_at_utc: now_ms(),
            nodes,
            packets: self.nodes.packets_since(cutoff).await?,
            topology: self.topology.links_heard_since(cutoff).await?,
            traceroutes: self.traceroutes.traceroutes_since(cutoff).await?,
        })
    }

    /// One export round: build, skip if empty, post.
    pub async fn export_once(&self) {
        let snapshot = match self.build_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Federated export: snapshot query failed: {}", e);
                return;
            }
        };

        if snapshot.is_empty() {
            tracing::info!("Federated export: nothing new to upload");
            return;
        }

        tracing::info!(
            "Federated export: uploading {} nodes, {} packets, {} links, {} traceroutes",
            snapshot.nodes.len(),
            snapshot.packets.len(),
            snapshot.topology.len(),
            snapshot.traceroutes.len()
        );

        match self
            .client
            .post(&self.config.api_url)
            .json(&snapshot)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Federated export: upload accepted");
            }
            Ok(response) => {
                tracing::warn!("Federated export: collector returned {}", response.status());
            }
            Err(e) => {
                tracing::warn!("Federated export: upload failed: {}", e);
            }
        }
    }

    /// Uploader loop; first export runs one interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Federated uploader is disabled");
            return;
        }
        if self.config.api_url.is_empty() {
            tracing::warn!("Federated uploader enabled but no api_url configured");
            return;
        }

        let period = Duration::from_secs(self.config.export_interval_minutes * 60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tracing::info!(
            "Federated uploader enabled: exporting every {} minutes to {}",
            self.config.export_interval_minutes,
            self.config.api_url
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.export_once().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Federated uploader shutting down");
                    break;
                }
            }
        }
    }
}
