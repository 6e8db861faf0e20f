//! Packet records as delivered by the radio driver.
//!
//! The driver decodes each LoRa frame into a [`PacketRecord`]: routing
//! metadata plus an optional [`DecodedPayload`] whose port tag selects the
//! typed sub-record. Field names follow the driver's JSON (camelCase), so a
//! serialized record round-trips through the driver representation
//! unchanged.

use serde::{Deserialize, Serialize};

/// A decoded radio frame.
///
/// Every field except the payload is optional: malformed or truncated
/// frames yield partially-populated records, and the ingestor decides what
/// is usable (a record without `from_id` is dropped outright).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketRecord {
    pub id: Option<u64>,
    pub from: Option<u32>,
    pub to: Option<u32>,
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub channel: Option<u32>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
    pub via_mqtt: bool,
    /// Low 8 bits of the relaying node's identifier, when the packet was
    /// forwarded. The full identity must be recovered heuristically.
    pub relay_node: Option<u32>,
    pub decoded: Option<DecodedPayload>,
}

impl PacketRecord {
    /// Port of the decoded payload, if any.
    pub fn port(&self) -> Option<PortNum> {
        self.decoded.as_ref().map(DecodedPayload::port)
    }

    /// `hop_start - hop_limit`; 0 means heard directly.
    pub fn hops_away(&self) -> Option<u32> {
        crate::nodeid::hops_away(self.hop_start, self.hop_limit)
    }
}

/// Typed payload variants keyed by the driver's `portnum` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "portnum")]
pub enum DecodedPayload {
    #[serde(rename = "TEXT_MESSAGE_APP")]
    TextMessage {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "POSITION_APP")]
    Position {
        #[serde(default)]
        position: PositionInfo,
    },
    #[serde(rename = "NODEINFO_APP")]
    NodeInfo {
        #[serde(default)]
        user: UserInfo,
    },
    #[serde(rename = "TELEMETRY_APP")]
    Telemetry {
        #[serde(default)]
        telemetry: TelemetryInfo,
    },
    #[serde(rename = "ROUTING_APP")]
    Routing,
    #[serde(rename = "TRACEROUTE_APP")]
    Traceroute {
        #[serde(default)]
        traceroute: RouteDiscovery,
    },
    #[serde(other)]
    Unknown,
}

impl DecodedPayload {
    pub fn port(&self) -> PortNum {
        match self {
            DecodedPayload::TextMessage { .. } => PortNum::TextMessage,
            DecodedPayload::Position { .. } => PortNum::Position,
            DecodedPayload::NodeInfo { .. } => PortNum::NodeInfo,
            DecodedPayload::Telemetry { .. } => PortNum::Telemetry,
            DecodedPayload::Routing => PortNum::Routing,
            DecodedPayload::Traceroute { .. } => PortNum::Traceroute,
            DecodedPayload::Unknown => PortNum::Unknown,
        }
    }
}

/// Port tags, named as the firmware names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortNum {
    TextMessage,
    Position,
    NodeInfo,
    Telemetry,
    Routing,
    Traceroute,
    Unknown,
}

impl PortNum {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortNum::TextMessage => "TEXT_MESSAGE_APP",
            PortNum::Position => "POSITION_APP",
            PortNum::NodeInfo => "NODEINFO_APP",
            PortNum::Telemetry => "TELEMETRY_APP",
            PortNum::Routing => "ROUTING_APP",
            PortNum::Traceroute => "TRACEROUTE_APP",
            PortNum::Unknown => "UNKNOWN_APP",
        }
    }
}

/// Position payload. Firmware emits either float degrees or integer-scaled
/// (1e-7 degree) fields depending on version; both are accepted and the
/// integer form wins because it is the raw representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionInfo {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub latitude_i: Option<i64>,
    pub longitude_i: Option<i64>,
}

impl PositionInfo {
    /// Latitude in decimal degrees.
    pub fn latitude_deg(&self) -> Option<f64> {
        self.latitude_i
            .map(|raw| raw as f64 * 1e-7)
            .or(self.latitude)
    }

    /// Longitude in decimal degrees.
    pub fn longitude_deg(&self) -> Option<f64> {
        self.longitude_i
            .map(|raw| raw as f64 * 1e-7)
            .or(self.longitude)
    }
}

/// User block of a nodeinfo payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
}

/// Telemetry payload: device and/or environment metric blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryInfo {
    pub device_metrics: Option<DeviceMetrics>,
    pub environment_metrics: Option<EnvironmentMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceMetrics {
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentMetrics {
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub barometric_pressure: Option<f64>,
}

/// Traceroute payload: the node numbers along the discovered route and the
/// SNR observed toward each hop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteDiscovery {
    pub route: Vec<u32>,
    pub snr_towards: Vec<f64>,
}
