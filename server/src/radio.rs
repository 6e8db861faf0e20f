//! Radio driver interface
//!
//! The driver that owns the serial/TCP link to the local node lives outside
//! this crate; it delivers decoded [`common::PacketRecord`]s into the
//! ingest channel and accepts probe sends through [`RadioLink`]. The
//! "currently connected radio" is one process-wide slot: set at connect,
//! cleared at disconnect, read by the schedulers which no-op when empty.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Errors from probe/text sends toward the radio
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("no radio interface connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// One entry of the driver's in-memory node table. `last_heard` is epoch
/// seconds as reported by the firmware.
#[derive(Debug, Clone, Default)]
pub struct DriverNode {
    pub num: u32,
    pub id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub snr: Option<f64>,
    pub last_heard: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub air_util_tx: Option<f64>,
}

impl DriverNode {
    /// Canonical identity, derived from the number when the driver has not
    /// filled the id field yet.
    pub fn canonical_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| common::num_to_id(self.num))
    }

    pub fn display_name(&self) -> String {
        self.long_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| self.canonical_id())
    }
}

/// Operations the core needs from a connected radio driver. Probe sends
/// always request a response from the destination.
pub trait RadioLink: Send + Sync {
    /// Identity of the locally attached node.
    fn local_node_id(&self) -> Option<String>;

    /// Snapshot of the driver's in-memory node table. Read-only from the
    /// core's perspective.
    fn node_table(&self) -> Vec<DriverNode>;

    /// Submit a route-discovery request toward `dest_num`.
    fn send_traceroute(&self, dest_num: u32, hop_limit: u32) -> Result<(), RadioError>;

    /// Request device telemetry from `dest_num`.
    fn send_telemetry_request(&self, dest_num: u32) -> Result<(), RadioError>;

    /// Send a text message; `dest_num = None` broadcasts.
    fn send_text(&self, dest_num: Option<u32>, channel: u32, text: &str) -> Result<(), RadioError>;
}

/// The process-wide current-radio slot.
#[derive(Default)]
pub struct RadioSlot {
    current: RwLock<Option<Arc<dyn RadioLink>>>,
}

impl RadioSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, link: Arc<dyn RadioLink>) {
        *self.current.write() = Some(link);
        tracing::info!("Radio interface connected");
    }

    pub fn disconnect(&self) {
        *self.current.write() = None;
        tracing::info!("Radio interface disconnected");
    }

    pub fn current(&self) -> Option<Arc<dyn RadioLink>> {
        self.current.read().clone()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted radio for scheduler and ingest tests: records every send
    /// and serves a fixed node table.
    #[derive(Default)]
    pub struct MockRadio {
        pub local_id: Option<String>,
        pub nodes: Vec<DriverNode>,
        pub sent_traceroutes: Mutex<Vec<(u32, u32)>>,
        pub sent_telemetry: Mutex<Vec<u32>>,
        pub sent_texts: Mutex<Vec<(Option<u32>, u32, String)>>,
        pub fail_sends: bool,
    }

    impl RadioLink for MockRadio {
        fn local_node_id(&self) -> Option<String> {
            self.local_id.clone()
        }

        fn node_table(&self) -> Vec<DriverNode> {
            self.nodes.clone()
        }

        fn send_traceroute(&self, dest_num: u32, hop_limit: u32) -> Result<(), RadioError> {
            if self.fail_sends {
                return Err(RadioError::Send("mock failure".to_string()));
            }
            self.sent_traceroutes.lock().push((dest_num, hop_limit));
            Ok(())
        }

        fn send_telemetry_request(&self, dest_num: u32) -> Result<(), RadioError> {
            if self.fail_sends {
                return Err(RadioError::Send("mock failure".to_string()));
            }
            self.sent_telemetry.lock().push(dest_num);
            Ok(())
        }

        fn send_text(
            &self,
            dest_num: Option<u32>,
            channel: u32,
            text: &str,
        ) -> Result<(), RadioError> {
            self.sent_texts.lock().push((dest_num, channel, text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_slot_connect_disconnect() {
        let slot = RadioSlot::new();
        assert!(slot.current().is_none());

        slot.connect(Arc::new(MockRadio::default()));
        assert!(slot.current().is_some());

        slot.disconnect();
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_driver_node_fallbacks() {
        let node = DriverNode {
            num: 0xaabbccdd,
            ..Default::default()
        };
        assert_eq!(node.canonical_id(), "!aabbccdd");
        assert_eq!(node.display_name(), "!aabbccdd");
    }
}
