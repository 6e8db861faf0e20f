//! Probe attempt log
//!
//! Both schedulers account for their probes here: a pending row per sent
//! request, closed by the correlators to `completed` or by the stale sweep
//! to `timeout`. The two attempt tables share a shape, so one service
//! serves both, keyed by [`ProbeKind`].

use crate::database::{now_ms, DbConnection, StoreResult};
use crate::traceroute_store::ProbeCandidate;
use rusqlite::{params, Row};
use serde::Serialize;

/// Which probe loop an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Traceroute,
    Telemetry,
}

impl ProbeKind {
    fn table(&self) -> &'static str {
        match self {
            ProbeKind::Traceroute => "traceroute_attempts",
            ProbeKind::Telemetry => "telemetry_requests",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Traceroute => "traceroute",
            ProbeKind::Telemetry => "telemetry",
        }
    }
}

/// One probe attempt. Fields past `completed_at_utc` are populated only for
/// the kind that records them (`traceroute_id` for traceroutes; the signal
/// and relay capture for telemetry).
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRow {
    pub id: i64,
    pub to_node_id: String,
    pub to_node_name: Option<String>,
    pub requested_at_utc: i64,
    pub status: String,
    pub completed_at_utc: Option<i64>,
    pub traceroute_id: Option<i64>,
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
    pub relay_node_id: Option<String>,
    pub relay_node_name: Option<String>,
    pub hops_away: Option<i64>,
}

/// Rollup of attempt outcomes for one probe kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttemptStats {
    pub pending: i64,
    pub completed: i64,
    pub timeout: i64,
    pub recent_total: i64,
    pub recent_completed: i64,
    pub recent_timeout: i64,
    pub recent_success_rate: Option<f64>,
    pub avg_snr: Option<f64>,
    pub avg_rssi: Option<f64>,
}

/// Response metadata captured when a telemetry attempt completes.
#[derive(Debug, Clone, Default)]
pub struct TelemetryResponseMeta {
    pub rx_snr: Option<f64>,
    pub rx_rssi: Option<i64>,
    pub relay_node_id: Option<String>,
    pub relay_node_name: Option<String>,
    pub hops_away: Option<i64>,
}

/// Service for probe attempt rows
pub struct ProbeLog {
    db: DbConnection,
}

impl ProbeLog {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Log a pending attempt at send time; returns the row id.
    pub async fn insert_attempt(
        &self,
        kind: ProbeKind,
        to_node_id: &str,
        to_node_name: Option<&str>,
    ) -> StoreResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (to_node_id, to_node_name, requested_at_utc, status)
                 VALUES (?, ?, ?, 'pending')",
                kind.table()
            ),
            params![to_node_id, to_node_name, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close the most recent pending traceroute attempt toward a node.
    /// Returns false when no pending row exists (a late or unsolicited
    /// response), which callers treat as a no-op.
    pub async fn complete_traceroute_attempt(
        &self,
        to_node_id: &str,
        traceroute_id: Option<i64>,
    ) -> StoreResult<bool> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE traceroute_attempts
             SET status = 'completed', completed_at_utc = ?, traceroute_id = ?
             WHERE id = (
                 SELECT id FROM traceroute_attempts
                 WHERE to_node_id = ? AND status = 'pending'
                 ORDER BY requested_at_utc DESC
                 LIMIT 1
             )",
            params![now_ms(), traceroute_id, to_node_id],
        )?;
        Ok(changed > 0)
    }

    /// Close the most recent pending telemetry attempt toward a node,
    /// storing the response's signal and relay capture on the row.
    pub async fn complete_telemetry_attempt(
        &self,
        to_node_id: &str,
        meta: &TelemetryResponseMeta,
    ) -> StoreResult<bool> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE telemetry_requests
             SET status = 'completed', completed_at_utc = ?,
                 rx_snr = ?, rx_rssi = ?, relay_node_id = ?, relay_node_name = ?, hops_away = ?
             WHERE id = (
                 SELECT id FROM telemetry_requests
                 WHERE to_node_id = ? AND status = 'pending'
                 ORDER BY requested_at_utc DESC
                 LIMIT 1
             )",
            params![
                now_ms(),
                meta.rx_snr,
                meta.rx_rssi,
                meta.relay_node_id,
                meta.relay_node_name,
                meta.hops_away,
                to_node_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Flip pending attempts older than the threshold to `timeout`.
    pub async fn timeout_stale_attempts(
        &self,
        kind: ProbeKind,
        timeout_seconds: i64,
    ) -> StoreResult<usize> {
        let conn = self.db.lock().await;
        let cutoff = now_ms() - timeout_seconds * 1000;
        let changed = conn.execute(
            &format!(
                "UPDATE {}
                 SET status = 'timeout'
                 WHERE status = 'pending' AND requested_at_utc < ?",
                kind.table()
            ),
            params![cutoff],
        )?;
        Ok(changed)
    }

    /// List attempts, newest first, optionally filtered by status.
    pub async fn get_attempts(
        &self,
        kind: ProbeKind,
        limit: usize,
        status: Option<&str>,
    ) -> StoreResult<Vec<AttemptRow>> {
        let conn = self.db.lock().await;
        let filter = match status {
            Some(_) => "WHERE status = ?1",
            None => "",
        };
        let sql = format!(
            "SELECT * FROM {} {} ORDER BY requested_at_utc DESC LIMIT {}",
            kind.table(),
            filter,
            limit as i64
        );
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| attempt_from_row(kind, row);
        let attempts = match status {
            Some(status) => stmt
                .query_map(params![status], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(attempts)
    }

    /// Outcome rollup: totals by status plus a 24 h window success rate;
    /// telemetry adds average response signal over completed rows.
    pub async fn attempt_stats(&self, kind: ProbeKind) -> StoreResult<AttemptStats> {
        let conn = self.db.lock().await;
        let mut stats = AttemptStats::default();

        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            kind.table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "completed" => stats.completed = count,
                "timeout" => stats.timeout = count,
                _ => {}
            }
        }

        let cutoff = now_ms() - 24 * 60 * 60 * 1000;
        let (total, completed, timeout): (i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*),
                        SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'timeout' THEN 1 ELSE 0 END)
                 FROM {}
                 WHERE requested_at_utc >= ?",
                kind.table()
            ),
            params![cutoff],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            },
        )?;
        stats.recent_total = total;
        stats.recent_completed = completed;
        stats.recent_timeout = timeout;
        if total > 0 {
            stats.recent_success_rate =
                Some((completed as f64 / total as f64 * 1000.0).round() / 10.0);
        }

        if kind == ProbeKind::Telemetry {
            let (avg_snr, avg_rssi): (Option<f64>, Option<f64>) = conn.query_row(
                "SELECT AVG(rx_snr), AVG(rx_rssi) FROM telemetry_requests
                 WHERE status = 'completed' AND requested_at_utc >= ?",
                params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.avg_snr = avg_snr.map(|v| (v * 10.0).round() / 10.0);
            stats.avg_rssi = avg_rssi.map(|v| v.round());
        }

        Ok(stats)
    }

    /// Completed telemetry attempts inside the window that carry a resolved
    /// (full-identity) relay, as coverage observations.
    pub async fn telemetry_relay_observations(
        &self,
        since_ms: i64,
    ) -> StoreResult<Vec<crate::node_store::RelayObservation>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT to_node_id, relay_node_id, hops_away, rx_snr, rx_rssi
             FROM telemetry_requests
             WHERE status = 'completed'
               AND relay_node_id IS NOT NULL
               AND relay_node_id LIKE '!%'
               AND completed_at_utc >= ?",
        )?;
        let observations = stmt
            .query_map(params![since_ms], |row| {
                Ok(crate::node_store::RelayObservation {
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

    /// Active nodes whose most recent *completed* telemetry attempt is
    /// absent or stale, optionally skipping nodes with a recent traceroute
    /// (the traceroute already exercised the path). Never-requested first,
    /// then oldest.
    #[allow(clippy::too_many_arguments)]
    pub async fn nodes_needing_telemetry(
        &self,
        active_threshold_minutes: i64,
        request_age_hours: i64,
        exclude_mqtt: bool,
        skip_recent_traceroutes: bool,
        traceroute_age_hours: i64,
        limit: usize,
    ) -> StoreResult<Vec<ProbeCandidate>> {
        let conn = self.db.lock().await;
        let now = now_ms();
        let active_cutoff = now - active_threshold_minutes * 60 * 1000;
        let request_cutoff = now - request_age_hours * 60 * 60 * 1000;
        let traceroute_cutoff = now - traceroute_age_hours * 60 * 60 * 1000;

        let mqtt_clause = if exclude_mqtt {
            "AND n.is_mqtt = 0"
        } else {
            ""
        };
        let traceroute_clause = if skip_recent_traceroutes {
            "AND (last_traceroute_utc IS NULL OR last_traceroute_utc < ?3)"
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
                MAX(tr.completed_at_utc) AS last_telemetry_utc,
                MAX(t.received_at_utc) AS last_traceroute_utc
             FROM nodes n
             LEFT JOIN telemetry_requests tr
                ON n.node_id = tr.to_node_id AND tr.status = 'completed'
             LEFT JOIN traceroutes t ON n.node_id = t.to_node_id
             WHERE n.last_seen_utc >= ?1
               AND n.node_num IS NOT NULL
               {}
             GROUP BY n.node_id, n.node_num, n.long_name, n.short_name, n.last_seen_utc
             HAVING (last_telemetry_utc IS NULL OR last_telemetry_utc < ?2)
               {}
             ORDER BY
                CASE WHEN last_telemetry_utc IS NULL THEN 0 ELSE 1 END,
                last_telemetry_utc ASC
             LIMIT ?4",
            mqtt_clause, traceroute_clause
        );

        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(
                params![active_cutoff, request_cutoff, traceroute_cutoff, limit as i64],
                |row| {
                    Ok(ProbeCandidate {
                        node_id: row.get(0)?,
                        node_num: row.get(1)?,
                        long_name: row.get(2)?,
                        short_name: row.get(3)?,
                        last_seen_utc: row.get(4)?,
                        last_probe_utc: row.get(5)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }
}

fn attempt_from_row(kind: ProbeKind, row: &Row<'_>) -> rusqlite::Result<AttemptRow> {
    Ok(AttemptRow {
        id: row.get("id")?,
        to_node_id: row.get("to_node_id")?,
        to_node_name: row.get("to_node_name")?,
        requested_at_utc: row.get("requested_at_utc")?,
        status: row.get("status")?,
        completed_at_utc: row.get("completed_at_utc")?,
        traceroute_id: match kind {
            ProbeKind::Traceroute => row.get("traceroute_id")?,
            ProbeKind::Telemetry => None,
        },
        rx_snr: match kind {
            ProbeKind::Telemetry => row.get("rx_snr")?,
            ProbeKind::Traceroute => None,
        },
        rx_rssi: match kind {
            ProbeKind::Telemetry => row.get("rx_rssi")?,
            ProbeKind::Traceroute => None,
        },
        relay_node_id: match kind {
            ProbeKind::Telemetry => row.get("relay_node_id")?,
            ProbeKind::Traceroute => None,
        },
        relay_node_name: match kind {
            ProbeKind::Telemetry => row.get("relay_node_name")?,
            ProbeKind::Traceroute => None,
        },
        hops_away: match kind {
            ProbeKind::Telemetry => row.get("hops_away")?,
            ProbeKind::Traceroute => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use crate::node_store::{NodeStore, NodeUpdate};
    use crate::traceroute_store::TracerouteStore;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_attempt_lifecycle() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let log = ProbeLog::new(db);

        log.insert_attempt(ProbeKind::Traceroute, "!22222222", Some("Target"))
            .await
            .unwrap();

        let pending = log
            .get_attempts(ProbeKind::Traceroute, 10, Some("pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        assert!(log
            .complete_traceroute_attempt("!22222222", Some(7))
            .await
            .unwrap());
        let completed = log
            .get_attempts(ProbeKind::Traceroute, 10, Some("completed"))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].traceroute_id, Some(7));

        // Nothing pending any more: completing again is a no-op.
        assert!(!log
            .complete_traceroute_attempt("!22222222", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_complete_closes_most_recent_pending() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let log = ProbeLog::new(db.clone());

        let first = log
            .insert_attempt(ProbeKind::Traceroute, "!22222222", None)
            .await
            .unwrap();
        let second = log
            .insert_attempt(ProbeKind::Traceroute, "!22222222", None)
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE traceroute_attempts SET requested_at_utc = ? WHERE id = ?",
                params![now_ms() - 60_000, first],
            )
            .unwrap();
        }

        log.complete_traceroute_attempt("!22222222", None)
            .await
            .unwrap();

        let attempts = log
            .get_attempts(ProbeKind::Traceroute, 10, None)
            .await
            .unwrap();
        let by_id = |id: i64| attempts.iter().find(|a| a.id == id).unwrap();
        assert_eq!(by_id(second).status, "completed");
        assert_eq!(by_id(first).status, "pending");
    }

    #[tokio::test]
    async fn test_timeout_stale_attempts() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let log = ProbeLog::new(db.clone());

        let stale = log
            .insert_attempt(ProbeKind::Telemetry, "!33333333", None)
            .await
            .unwrap();
        log.insert_attempt(ProbeKind::Telemetry, "!44444444", None)
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE telemetry_requests SET requested_at_utc = ? WHERE id = ?",
                params![now_ms() - 180_000, stale],
            )
            .unwrap();
        }

        let timed_out = log
            .timeout_stale_attempts(ProbeKind::Telemetry, 120)
            .await
            .unwrap();
        assert_eq!(timed_out, 1);

        let rows = log
            .get_attempts(ProbeKind::Telemetry, 10, Some("timeout"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].to_node_id, "!33333333");
    }

    #[tokio::test]
    async fn test_telemetry_completion_captures_response_meta() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let log = ProbeLog::new(db);

        log.insert_attempt(ProbeKind::Telemetry, "!55555555", None)
            .await
            .unwrap();
        let meta = TelemetryResponseMeta {
            rx_snr: Some(3.5),
            rx_rssi: Some(-95),
            relay_node_id: Some("!aabbccdd".to_string()),
            relay_node_name: Some("Relay".to_string()),
            hops_away: Some(2),
        };
        assert!(log.complete_telemetry_attempt("!55555555", &meta).await.unwrap());

        let rows = log
            .get_attempts(ProbeKind::Telemetry, 10, Some("completed"))
            .await
            .unwrap();
        assert_eq!(rows[0].rx_snr, Some(3.5));
        assert_eq!(rows[0].relay_node_id.as_deref(), Some("!aabbccdd"));
        assert_eq!(rows[0].hops_away, Some(2));
    }

    #[tokio::test]
    async fn test_telemetry_candidates_skip_recent_traceroute() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let nodes = NodeStore::new(db.clone());
        let traceroutes = TracerouteStore::new(db.clone());
        let log = ProbeLog::new(db.clone());

        // Active node, telemetry never completed, traceroute one hour ago.
        nodes
            .upsert_node(&NodeUpdate {
                node_id: "!44444444".to_string(),
                node_num: Some(0x44444444),
                ..Default::default()
            })
            .await
            .unwrap();
        traceroutes
            .insert_traceroute("!44444444", Some("!44444444"), &[], None, None)
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE traceroutes SET received_at_utc = ?",
                params![now_ms() - 60 * 60 * 1000],
            )
            .unwrap();
        }

        // Recent traceroute covers the node: skipped.
        let skipped = log
            .nodes_needing_telemetry(120, 2, true, true, 4, 10)
            .await
            .unwrap();
        assert!(skipped.is_empty());

        // Same query with the skip disabled selects it.
        let selected = log
            .nodes_needing_telemetry(120, 2, true, false, 4, 10)
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].node_id, "!44444444");
    }

    #[tokio::test]
    async fn test_telemetry_staleness_measured_on_completed_attempts() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let nodes = NodeStore::new(db.clone());
        let log = ProbeLog::new(db.clone());

        nodes
            .upsert_node(&NodeUpdate {
                node_id: "!66666666".to_string(),
                node_num: Some(0x66666666),
                ..Default::default()
            })
            .await
            .unwrap();

        // A timed-out request does not count as coverage.
        let attempt = log
            .insert_attempt(ProbeKind::Telemetry, "!66666666", None)
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE telemetry_requests SET status = 'timeout' WHERE id = ?",
                params![attempt],
            )
            .unwrap();
        }
        let candidates = log
            .nodes_needing_telemetry(120, 2, true, true, 4, 10)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        // A fresh completed request does.
        log.insert_attempt(ProbeKind::Telemetry, "!66666666", None)
            .await
            .unwrap();
        log.complete_telemetry_attempt("!66666666", &TelemetryResponseMeta::default())
            .await
            .unwrap();
        let candidates = log
            .nodes_needing_telemetry(120, 2, true, true, 4, 10)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_attempt_stats() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let log = ProbeLog::new(db);

        for _ in 0..3 {
            log.insert_attempt(ProbeKind::Traceroute, "!11111111", None)
                .await
                .unwrap();
        }
        log.complete_traceroute_attempt("!11111111", None)
            .await
            .unwrap();
        log.complete_traceroute_attempt("!11111111", None)
            .await
            .unwrap();

        let stats = log.attempt_stats(ProbeKind::Traceroute).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.recent_total, 3);
        assert_eq!(stats.recent_success_rate, Some(66.7));
    }
}
