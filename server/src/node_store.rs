//! Node and packet-history store
//!
//! Service for upserting node state and appending the bounded per-node
//! packet history. All timestamps are UTC epoch milliseconds.

use crate::database::{now_ms, DbConnection, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

/// Altitude above which a node is flagged as airborne (meters).
pub const AIRPLANE_ALTITUDE_THRESHOLD_M: f64 = 750.0;

/// Display names are damped to at most one refresh per this interval, so a
/// stale packet replayed through the mesh cannot flap them.
const NAME_UPDATE_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// A persisted node row.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub node_num: Option<i64>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub hardware_model: Option<String>,
    pub firmware_version: Option<String>,
    pub is_mqtt: bool,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub is_charging: Option<bool>,
    pub is_powered: Option<bool>,
    pub last_battery_update_utc: Option<i64>,
    pub first_seen_utc: i64,
    pub last_seen_utc: i64,
    pub total_packets_received: i64,
    pub is_ignored: bool,
    pub is_airplane: bool,
    pub last_name_update_utc: Option<i64>,
}

impl NodeRow {
    /// Best display name: long, short, then the identity itself.
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .unwrap_or(&self.node_id)
    }
}

/// Fields extracted from a packet (or the driver's node table) for a node
/// upsert. Absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub node_id: String,
    pub node_num: Option<i64>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub hardware_model: Option<String>,
    pub firmware_version: Option<String>,
    pub is_mqtt: Option<bool>,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub is_charging: Option<bool>,
    pub is_powered: Option<bool>,
}

/// One packet-history insert.
#[derive(Debug, Clone, Default)]
pub struct PacketInsert {
    pub node_id: String,
    pub packet_type: Option<String>,
    pub channel_index: Option<i64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
    pub hops_away: Option<i64>,
    pub via_mqtt: bool,
    pub relay_node_id: Option<String>,
    pub relay_node_name: Option<String>,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub message_text: Option<String>,
    pub raw_packet: Option<String>,
}

/// A stored packet-history row.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRow {
    pub id: i64,
    pub node_id: String,
    pub received_at_utc: i64,
    pub packet_type: Option<String>,
    pub channel_index: Option<i64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
    pub hops_away: Option<i64>,
    pub via_mqtt: bool,
    pub relay_node_id: Option<String>,
    pub relay_node_name: Option<String>,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub message_text: Option<String>,
    pub raw_packet: Option<String>,
}

/// A relayed-packet observation used by the coverage view.
#[derive(Debug, Clone)]
pub struct RelayObservation {
    pub node_id: String,
    pub relay_node_id: String,
    pub hops_away: i64,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
}

/// Aggregate network statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub total_nodes: i64,
    pub active_nodes: i64,
    pub total_packets: i64,
    pub active_links: i64,
    pub avg_link_quality: f64,
}

/// Service for node rows and per-node packet history
pub struct NodeStore {
    db: DbConnection,
}

impl NodeStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert or update node state.
    ///
    /// New nodes start with `first_seen = last_seen = now` and one packet
    /// counted. Existing nodes always bump `last_seen` and the packet
    /// count; supplied fields refresh in place, except display names which
    /// refresh at most once per 24 h. `is_airplane` is recomputed whenever
    /// an altitude is supplied.
    pub async fn upsert_node(&self, update: &NodeUpdate) -> StoreResult<()> {
        let conn = self.db.lock().await;
        let now = now_ms();

        let existing: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_name_update_utc FROM nodes WHERE node_id = ?",
                params![update.node_id],
                |row| row.get(0),
            )
            .optional()?;

        let is_airplane = update
            .altitude
            .map(|alt| alt > AIRPLANE_ALTITUDE_THRESHOLD_M);

        match existing {
            Some(last_name_update) => {
                conn.execute(
                    "UPDATE nodes SET
                        node_num = COALESCE(?1, node_num),
                        latitude = COALESCE(?2, latitude),
                        longitude = COALESCE(?3, longitude),
                        altitude = COALESCE(?4, altitude),
                        hardware_model = COALESCE(?5, hardware_model),
                        firmware_version = COALESCE(?6, firmware_version),
                        is_mqtt = COALESCE(?7, is_mqtt),
                        battery_level = COALESCE(?8, battery_level),
                        voltage = COALESCE(?9, voltage),
                        is_charging = COALESCE(?10, is_charging),
                        is_powered = COALESCE(?11, is_powered),
                        is_airplane = COALESCE(?12, is_airplane),
                        last_battery_update_utc = COALESCE(?13, last_battery_update_utc),
                        last_seen_utc = ?14,
                        total_packets_received = total_packets_received + 1
                     WHERE node_id = ?15",
                    params![
                        update.node_num,
                        update.latitude,
                        update.longitude,
                        update.altitude,
                        update.hardware_model,
                        update.firmware_version,
                        update.is_mqtt,
                        update.battery_level,
                        update.voltage,
                        update.is_charging,
                        update.is_powered,
                        is_airplane,
                        update.battery_level.map(|_| now),
                        now,
                        update.node_id,
                    ],
                )?;

                let names_due = match last_name_update {
                    None => true,
                    Some(ts) => now - ts >= NAME_UPDATE_INTERVAL_MS,
                };
                if names_due && (update.short_name.is_some() || update.long_name.is_some()) {
                    conn.execute(
                        "UPDATE nodes SET
                            short_name = COALESCE(?1, short_name),
                            long_name = COALESCE(?2, long_name),
                            last_name_update_utc = ?3
                         WHERE node_id = ?4",
                        params![update.short_name, update.long_name, now, update.node_id],
                    )?;
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO nodes (
                        node_id, node_num, short_name, long_name,
                        latitude, longitude, altitude,
                        hardware_model, firmware_version, is_mqtt,
                        battery_level, voltage, is_charging, is_powered,
                        last_battery_update_utc,
                        first_seen_utc, last_seen_utc, total_packets_received,
                        is_airplane, last_name_update_utc
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, COALESCE(?, 0), ?, ?, ?, ?, ?, ?, ?, 1, COALESCE(?, 0), ?)",
                    params![
                        update.node_id,
                        update.node_num,
                        update.short_name,
                        update.long_name,
                        update.latitude,
                        update.longitude,
                        update.altitude,
                        update.hardware_model,
                        update.firmware_version,
                        update.is_mqtt,
                        update.battery_level,
                        update.voltage,
                        update.is_charging,
                        update.is_powered,
                        update.battery_level.map(|_| now),
                        now,
                        now,
                        is_airplane,
                        now,
                    ],
                )?;
                tracing::info!(
                    "New node discovered: {} ({})",
                    update.node_id,
                    update.long_name.as_deref().unwrap_or("unknown")
                );
            }
        }

        Ok(())
    }

    /// Append a packet-history row and evict the oldest rows for that node
    /// past `max_per_node`. A cap of 0 rejects the write; returns whether a
    /// row was stored.
    pub async fn insert_packet(
        &self,
        packet: &PacketInsert,
        max_per_node: usize,
    ) -> StoreResult<bool> {
        if max_per_node == 0 {
            return Ok(false);
        }

        let conn = self.db.lock().await;
        let now = now_ms();

        conn.execute(
            "INSERT INTO packet_history (
                node_id, received_at_utc, packet_type, channel_index,
                hop_start, hop_limit, hops_away, via_mqtt,
                relay_node_id, relay_node_name, rx_snr, rx_rssi,
                latitude, longitude, altitude,
                battery_level, voltage, temperature, humidity, pressure,
                message_text, raw_packet
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                packet.node_id,
                now,
                packet.packet_type,
                packet.channel_index,
                packet.hop_start,
                packet.hop_limit,
                packet.hops_away,
                packet.via_mqtt,
                packet.relay_node_id,
                packet.relay_node_name,
                packet.rx_snr,
                packet.rx_rssi,
                packet.latitude,
                packet.longitude,
                packet.altitude,
                packet.battery_level,
                packet.voltage,
                packet.temperature,
                packet.humidity,
                packet.pressure,
                packet.message_text,
                packet.raw_packet,
            ],
        )?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM packet_history WHERE node_id = ?",
            params![packet.node_id],
            |row| row.get(0),
        )?;

        if count > max_per_node as i64 {
            let delete_count = count - max_per_node as i64;
            conn.execute(
                "DELETE FROM packet_history
                 WHERE id IN (
                     SELECT id FROM packet_history
                     WHERE node_id = ?
                     ORDER BY received_at_utc ASC, id ASC
                     LIMIT ?
                 )",
                params![packet.node_id, delete_count],
            )?;
        }

        Ok(true)
    }

    pub async fn get_all_nodes(&self) -> StoreResult<Vec<NodeRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY last_seen_utc DESC")?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    pub async fn get_node(&self, node_id: &str) -> StoreResult<Option<NodeRow>> {
        let conn = self.db.lock().await;
        let node = conn
            .query_row(
                "SELECT * FROM nodes WHERE node_id = ?",
                params![node_id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub async fn get_node_packets(
        &self,
        node_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PacketRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM packet_history
             WHERE node_id = ?
             ORDER BY received_at_utc DESC
             LIMIT ?",
        )?;
        let packets = stmt
            .query_map(params![node_id, limit as i64], packet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packets)
    }

    /// Packets newer than `since_ms`, oldest first (federated export).
    pub async fn packets_since(&self, since_ms: i64) -> StoreResult<Vec<PacketRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM packet_history
             WHERE received_at_utc >= ?
             ORDER BY received_at_utc ASC",
        )?;
        let packets = stmt
            .query_map(params![since_ms], packet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packets)
    }

    /// Relayed packets with a resolved (full-identity) relay inside the
    /// window, newest first. Partial relay markers never match the `!`
    /// prefix and are excluded here by construction.
    pub async fn relay_observations(&self, since_ms: i64) -> StoreResult<Vec<RelayObservation>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT node_id, relay_node_id, hops_away, rx_snr, rx_rssi
             FROM packet_history
             WHERE relay_node_id IS NOT NULL
               AND relay_node_id LIKE '!%'
               AND received_at_utc >= ?
             ORDER BY received_at_utc DESC",
        )?;
        let observations = stmt
            .query_map(params![since_ms], |row| {
                Ok(RelayObservation {
                    node_id: row.get(0)?,
                    relay_node_id: row.get(1)?,
                    hops_away: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    rx_snr: row.get(3)?,
                    rx_rssi: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(observations)
    }

    /// Histogram of hops-away over packets inside the window.
    pub async fn hop_histogram_since(&self, since_ms: i64) -> StoreResult<Vec<(i64, i64)>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT hops_away, COUNT(*) FROM packet_history
             WHERE hops_away IS NOT NULL AND received_at_utc >= ?
             GROUP BY hops_away
             ORDER BY hops_away ASC",
        )?;
        let histogram = stmt
            .query_map(params![since_ms], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(histogram)
    }

    /// Set or clear the operator ignore flag; false when the node is unknown.
    pub async fn set_node_ignored(&self, node_id: &str, ignored: bool) -> StoreResult<bool> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE nodes SET is_ignored = ? WHERE node_id = ?",
            params![ignored, node_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_statistics(&self) -> StoreResult<NetworkStats> {
        let conn = self.db.lock().await;
        let one_hour_ago = now_ms() - 60 * 60 * 1000;

        let total_nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        let active_nodes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE last_seen_utc > ?",
            params![one_hour_ago],
            |r| r.get(0),
        )?;
        let total_packets: i64 =
            conn.query_row("SELECT COUNT(*) FROM packet_history", [], |r| r.get(0))?;
        let active_links: i64 = conn.query_row(
            "SELECT COUNT(*) FROM network_topology WHERE is_active = 1",
            [],
            |r| r.get(0),
        )?;
        let avg_link_quality: Option<f64> = conn.query_row(
            "SELECT AVG(link_quality_score) FROM network_topology WHERE is_active = 1",
            [],
            |r| r.get(0),
        )?;

        Ok(NetworkStats {
            total_nodes,
            active_nodes,
            total_packets,
            active_links,
            avg_link_quality: (avg_link_quality.unwrap_or(0.0) * 100.0).round() / 100.0,
        })
    }

}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        node_id: row.get("node_id")?,
        node_num: row.get("node_num")?,
        short_name: row.get("short_name")?,
        long_name: row.get("long_name")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        altitude: row.get("altitude")?,
        hardware_model: row.get("hardware_model")?,
        firmware_version: row.get("firmware_version")?,
        is_mqtt: row.get("is_mqtt")?,
        battery_level: row.get("battery_level")?,
        voltage: row.get("voltage")?,
        is_charging: row.get("is_charging")?,
        is_powered: row.get("is_powered")?,
        last_battery_update_utc: row.get("last_battery_update_utc")?,
        first_seen_utc: row.get("first_seen_utc")?,
        last_seen_utc: row.get("last_seen_utc")?,
        total_packets_received: row.get("total_packets_received")?,
        is_ignored: row.get("is_ignored")?,
        is_airplane: row.get("is_airplane")?,
        last_name_update_utc: row.get("last_name_update_utc")?,
    })
}

fn packet_from_row(row: &Row<'_>) -> rusqlite::Result<PacketRow> {
    Ok(PacketRow {
        id: row.get("id")?,
        node_id: row.get("node_id")?,
        received_at_utc: row.get("received_at_utc")?,
        packet_type: row.get("packet_type")?,
        channel_index: row.get("channel_index")?,
        hop_start: row.get("hop_start")?,
        hop_limit: row.get("hop_limit")?,
        hops_away: row.get("hops_away")?,
        via_mqtt: row.get("via_mqtt")?,
        relay_node_id: row.get("relay_node_id")?,
        relay_node_name: row.get("relay_node_name")?,
        rx_snr: row.get("rx_snr")?,
        rx_rssi: row.get("rx_rssi")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        altitude: row.get("altitude")?,
        battery_level: row.get("battery_level")?,
        voltage: row.get("voltage")?,
        temperature: row.get("temperature")?,
        humidity: row.get("humidity")?,
        pressure: row.get("pressure")?,
        message_text: row.get("message_text")?,
        raw_packet: row.get("raw_packet")?,
    })
}
