//! Traceroute record store
//!
//! Persists discovered routes (complete or partial) and answers the
//! traceroute scheduler's candidate query.

use crate::database::{now_ms, DbConnection, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

/// A stored traceroute. `route` holds full node identities in travel
/// order; `snr_towards` holds the per-hop SNR sequence when reported.
#[derive(Debug, Clone, Serialize)]
pub struct TracerouteRow {
    pub id: i64,
    pub from_node_id: String,
    pub to_node_id: Option<String>,
    pub route: Vec<String>,
    pub route_names: Vec<String>,
    pub hop_count: i64,
    pub received_at_utc: i64,
    pub snr_towards: Option<Vec<f64>>,
    pub packet_id: Option<i64>,
    pub from_long_name: Option<String>,
    pub from_short_name: Option<String>,
    pub to_long_name: Option<String>,
    pub to_short_name: Option<String>,
}

/// A node selected by a scheduler candidate query.
#[derive(Debug, Clone)]
pub struct ProbeCandidate {
    pub node_id: String,
    pub node_num: i64,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub last_seen_utc: i64,
    /// Most recent qualifying probe toward this node, when any.
    pub last_probe_utc: Option<i64>,
}

impl ProbeCandidate {
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .unwrap_or(&self.node_id)
    }
}

/// Service for traceroute records
pub struct TracerouteStore {
    db: DbConnection,
}

impl TracerouteStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert a traceroute record; returns its row id. Incomplete routes
    /// (fewer than two entries) are stored as-is — hop count is simply the
    /// route length.
    pub async fn insert_traceroute(
        &self,
        from_node_id: &str,
        to_node_id: Option<&str>,
        route: &[String],
        snr_towards: Option<&[f64]>,
        packet_id: Option<i64>,
    ) -> StoreResult<i64> {
        let conn = self.db.lock().await;
        let now = now_ms();
        let route_json = serde_json::to_string(route)?;
        let snr_json = snr_towards.map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO traceroutes (
                from_node_id, to_node_id, route_json, hop_count,
                received_at_utc, snr_json, packet_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                from_node_id,
                to_node_id,
                route_json,
                route.len() as i64,
                now,
                snr_json,
                packet_id,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub async fn get_all_traceroutes(&self, limit: usize) -> StoreResult<Vec<TracerouteRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!("{} ORDER BY t.received_at_utc DESC LIMIT ?", SELECT_JOINED))?;
        let mut rows = stmt
            .query_map(params![limit as i64], traceroute_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let lookup = short_names(&conn)?;
        for row in &mut rows {
            row.route_names = route_names(&row.route, &lookup);
        }
        Ok(rows)
    }

    pub async fn get_traceroute(&self, id: i64) -> StoreResult<Option<TracerouteRow>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!("{} WHERE t.id = ?", SELECT_JOINED),
                params![id],
                traceroute_from_row,
            )
            .optional()?;

        match row {
            Some(mut row) => {
                let lookup = short_names(&conn)?;
                row.route_names = route_names(&row.route, &lookup);
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Traceroutes involving the node as source, destination, or a route hop.
    pub async fn get_traceroutes_by_node(
        &self,
        node_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<TracerouteRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE t.from_node_id = ? OR t.to_node_id = ? OR t.route_json LIKE ?
             ORDER BY t.received_at_utc DESC LIMIT ?",
            SELECT_JOINED
        ))?;
        let mut rows = stmt
            .query_map(
                params![node_id, node_id, format!("%{}%", node_id), limit as i64],
                traceroute_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let lookup = short_names(&conn)?;
        for row in &mut rows {
            row.route_names = route_names(&row.route, &lookup);
        }
        Ok(rows)
    }

    /// Traceroutes received since the cutoff, oldest first (federated export).
    pub async fn traceroutes_since(&self, since_ms: i64) -> StoreResult<Vec<TracerouteRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE t.received_at_utc >= ? ORDER BY t.received_at_utc ASC",
            SELECT_JOINED
        ))?;
        let rows = stmt
            .query_map(params![since_ms], traceroute_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active nodes whose most recent traceroute-as-destination is absent or
    /// stale. Never-traced nodes come first, then oldest-traced.
    pub async fn nodes_needing_traceroute(
        &self,
        active_threshold_minutes: i64,
        traceroute_age_hours: i64,
        exclude_mqtt: bool,
        limit: usize,
    ) -> StoreResult<Vec<ProbeCandidate>> {
        let conn = self.db.lock().await;
        let now = now_ms();
        let active_cutoff = now - active_threshold_minutes * 60 * 1000;
        let traceroute_cutoff = now - traceroute_age_hours * 60 * 60 * 1000;

        let mqtt_clause = if exclude_mqtt {
            "AND n.is_mqtt = 0"
        } else {
            ""
        };

        let sql = format!(
            "SELECT
                n.node_id,
                n.node_num,
                n.long_name,
                n.short_name,
                n.last_seen_utc,
                MAX(t.received_at_utc) AS last_traceroute_utc
             FROM nodes n
             LEFT JOIN traceroutes t ON n.node_id = t.to_node_id
             WHERE n.last_seen_utc >= ?
               AND n.node_num IS NOT NULL
               {}
             GROUP BY n.node_id, n.node_num, n.long_name, n.short_name, n.last_seen_utc
             HAVING last_traceroute_utc IS NULL OR last_traceroute_utc < ?
             ORDER BY
                CASE WHEN last_traceroute_utc IS NULL THEN 0 ELSE 1 END,
                last_traceroute_utc ASC
             LIMIT ?",
            mqtt_clause
        );

        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(
                params![active_cutoff, traceroute_cutoff, limit as i64],
                candidate_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }
}

const SELECT_JOINED: &str = "SELECT t.id, t.from_node_id, t.to_node_id, t.route_json, t.hop_count,
        t.received_at_utc, t.snr_json, t.packet_id,
        fn.long_name AS from_long_name, fn.short_name AS from_short_name,
        tn.long_name AS to_long_name, tn.short_name AS to_short_name
 FROM traceroutes t
 LEFT JOIN nodes fn ON t.from_node_id = fn.node_id
 LEFT JOIN nodes tn ON t.to_node_id = tn.node_id";

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<ProbeCandidate> {
    Ok(ProbeCandidate {
        node_id: row.get(0)?,
        node_num: row.get(1)?,
        long_name: row.get(2)?,
        short_name: row.get(3)?,
        last_seen_utc: row.get(4)?,
        last_probe_utc: row.get(5)?,
    })
}

fn traceroute_from_row(row: &Row<'_>) -> rusqlite::Result<TracerouteRow> {
    let route_json: String = row.get("route_json")?;
    let snr_json: Option<String> = row.get("snr_json")?;
    Ok(TracerouteRow {
        id: row.get("id")?,
        from_node_id: row.get("from_node_id")?,
        to_node_id: row.get("to_node_id")?,
        route: serde_json::from_str(&route_json).unwrap_or_default(),
        route_names: Vec::new(),
        hop_count: row.get("hop_count")?,
        received_at_utc: row.get("received_at_utc")?,
        snr_towards: snr_json.and_then(|json| serde_json::from_str(&json).ok()),
        packet_id: row.get("packet_id")?,
        from_long_name: row.get("from_long_name")?,
        from_short_name: row.get("from_short_name")?,
        to_long_name: row.get("to_long_name")?,
        to_short_name: row.get("to_short_name")?,
    })
}

fn short_names(conn: &rusqlite::Connection) -> StoreResult<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT node_id, short_name FROM nodes WHERE short_name IS NOT NULL")?;
    let mut lookup = HashMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (node_id, short_name) = row?;
        lookup.insert(node_id, short_name);
    }
    Ok(lookup)
}

/// Label each hop with its short name, falling back to the last four hex
/// digits of the identity.
fn route_names(route: &[String], lookup: &HashMap<String, String>) -> Vec<String> {
    route
        .iter()
        .map(|id| {
            lookup.get(id).cloned().unwrap_or_else(|| {
                let tail = id.len().saturating_sub(4);
                id[tail..].to_string()
            })
        })
        .collect()
}
