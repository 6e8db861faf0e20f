//! Shared application state
//!
//! One owning structure aggregates the store services, the radio slot, and
//! the packet channel; workers and HTTP handlers borrow it by clone.

use crate::config::Config;
use crate::database::DbConnection;
use crate::ingest::{packet_channel, Ingestor};
use crate::node_store::NodeStore;
use crate::probe_log::ProbeLog;
use crate::radio::RadioSlot;
use crate::topology_store::TopologyStore;
use crate::traceroute_store::TracerouteStore;
use common::PacketRecord;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub nodes: Arc<NodeStore>,
    pub topology: Arc<TopologyStore>,
    pub traceroutes: Arc<TracerouteStore>,
    pub probes: Arc<ProbeLog>,
    pub radio: Arc<RadioSlot>,
    pub config: Arc<Config>,
    /// Handed to the radio driver; every received packet goes through here
    /// into the ingest worker.
    pub packet_sender: mpsc::UnboundedSender<PacketRecord>,
    pub server_start_time: Instant,
}

impl AppState {
    /// Creates the state and returns the receiving end of the packet
    /// channel for the ingest worker.
    pub fn new(
        db: DbConnection,
        config: Arc<Config>,
    ) -> (Self, mpsc::UnboundedReceiver<PacketRecord>) {
        let (packet_sender, packet_receiver) = packet_channel();
        let state = Self {
            nodes: Arc::new(NodeStore::new(db.clone())),
            topology: Arc::new(TopologyStore::new(db.clone())),
            traceroutes: Arc::new(TracerouteStore::new(db.clone())),
            probes: Arc::new(ProbeLog::new(db)),
            radio: Arc::new(RadioSlot::new()),
            config,
            packet_sender,
            server_start_time: Instant::now(),
        };
        (state, packet_receiver)
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.nodes.clone(),
            self.topology.clone(),
            self.traceroutes.clone(),
            self.probes.clone(),
            self.radio.clone(),
            self.config.clone(),
        )
    }
}
