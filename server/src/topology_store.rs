//! Network topology store
//!
//! Maintains directed edges between nodes with running signal aggregates
//! and a composite link-quality score, plus the staleness sweep that
//! retires edges not heard from recently.

use crate::database::{now_ms, DbConnection, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// How often the staleness sweep runs.
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// A directed edge row.
#[derive(Debug, Clone, Serialize)]
pub struct LinkRow {
    pub id: i64,
    pub source_node_id: String,
    pub neighbor_node_id: String,
    pub first_heard_utc: i64,
    pub last_heard_utc: i64,
    pub total_packets: i64,
    pub avg_snr: Option<f64>,
    pub avg_rssi: Option<f64>,
    pub min_snr: Option<f64>,
    pub max_snr: Option<f64>,
    pub min_rssi: Option<f64>,
    pub max_rssi: Option<f64>,
    pub link_quality_score: Option<f64>,
    pub is_active: bool,
    pub last_hop_count: Option<i64>,
}

/// Composite link quality in [0, 100]: 40% SNR, 40% RSSI, 20% packet-count
/// reliability. A missing component contributes zero.
pub fn link_quality(snr: Option<f64>, rssi: Option<f64>, packet_count: i64) -> f64 {
    let mut score = 0.0;

    if let Some(snr) = snr {
        // SNR typically ranges from -20 to +20 dB
        let snr_normalized = ((snr + 20.0) * 2.5).clamp(0.0, 100.0);
        score += snr_normalized * 0.4;
    }

    if let Some(rssi) = rssi {
        // RSSI typically ranges from -120 to -30 dBm
        let rssi_normalized = ((rssi + 120.0) * 1.11).clamp(0.0, 100.0);
        score += rssi_normalized * 0.4;
    }

    let reliability = (packet_count as f64 * 2.0).min(100.0);
    score += reliability * 0.2;

    (score * 100.0).round() / 100.0
}

/// Service for topology edges
pub struct TopologyStore {
    db: DbConnection,
}

impl TopologyStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Record that `source` reached `neighbor`, folding the sample into the
    /// edge's running aggregates. The read-modify-write happens under the
    /// connection lock so interleaved updates cannot corrupt the means.
    pub async fn update_link(
        &self,
        source_id: &str,
        neighbor_id: &str,
        snr: Option<f64>,
        rssi: Option<i64>,
        hop_count: Option<i64>,
    ) -> StoreResult<()> {
        let conn = self.db.lock().await;
        let now = now_ms();
        let rssi = rssi.map(|v| v as f64);

        let existing: Option<(i64, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>)> =
            conn.query_row(
                "SELECT total_packets, avg_snr, avg_rssi, min_snr, max_snr, min_rssi, max_rssi
                 FROM network_topology
                 WHERE source_node_id = ? AND neighbor_node_id = ?",
                params![source_id, neighbor_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            Some((old_count, avg_snr, avg_rssi, min_snr, max_snr, min_rssi, max_rssi)) => {
                let total_packets = old_count + 1;

                let (avg_snr, min_snr, max_snr) = fold_sample(snr, old_count, avg_snr, min_snr, max_snr);
                let (avg_rssi, min_rssi, max_rssi) =
                    fold_sample(rssi, old_count, avg_rssi, min_rssi, max_rssi);

                let quality = link_quality(avg_snr, avg_rssi, total_packets);

                conn.execute(
                    "UPDATE network_topology SET
                        last_heard_utc = ?,
                        total_packets = ?,
                        avg_snr = ?,
                        avg_rssi = ?,
                        min_snr = ?,
                        max_snr = ?,
                        min_rssi = ?,
                        max_rssi = ?,
                        link_quality_score = ?,
                        is_active = 1,
                        last_hop_count = COALESCE(?, last_hop_count)
                     WHERE source_node_id = ? AND neighbor_node_id = ?",
                    params![
                        now,
                        total_packets,
                        avg_snr,
                        avg_rssi,
                        min_snr,
                        max_snr,
                        min_rssi,
                        max_rssi,
                        quality,
                        hop_count,
                        source_id,
                        neighbor_id,
                    ],
                )?;
            }
            None => {
                let quality = link_quality(snr, rssi, 1);
                conn.execute(
                    "INSERT INTO network_topology (
                        source_node_id, neighbor_node_id, first_heard_utc, last_heard_utc,
                        total_packets, avg_snr, avg_rssi, min_snr, max_snr, min_rssi, max_rssi,
                        link_quality_score, is_active, last_hop_count
                    ) VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
                    params![
                        source_id, neighbor_id, now, now, snr, rssi, snr, snr, rssi, rssi,
                        quality, hop_count,
                    ],
                )?;
            }
        }

        Ok(())
    }

    /// Retire edges not heard within the timeout; returns how many flipped.
    pub async fn mark_inactive_links(&self, timeout_minutes: i64) -> StoreResult<usize> {
        let conn = self.db.lock().await;
        let cutoff = now_ms() - timeout_minutes * 60 * 1000;
        let changed = conn.execute(
            "UPDATE network_topology
             SET is_active = 0
             WHERE last_heard_utc < ? AND is_active = 1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    pub async fn get_topology(&self, active_only: bool) -> StoreResult<Vec<LinkRow>> {
        let conn = self.db.lock().await;
        let sql = if active_only {
            "SELECT * FROM network_topology WHERE is_active = 1"
        } else {
            "SELECT * FROM network_topology"
        };
        let mut stmt = conn.prepare(sql)?;
        let links = stmt
            .query_map([], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Active edges touching the node, in either direction.
    pub async fn get_neighbors(&self, node_id: &str) -> StoreResult<Vec<LinkRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM network_topology
             WHERE (source_node_id = ? OR neighbor_node_id = ?)
               AND is_active = 1",
        )?;
        let links = stmt
            .query_map(params![node_id, node_id], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Active edges heard since the cutoff (federated export).
    pub async fn links_heard_since(&self, since_ms: i64) -> StoreResult<Vec<LinkRow>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM network_topology
             WHERE is_active = 1 AND last_heard_utc >= ?",
        )?;
        let links = stmt
            .query_map(params![since_ms], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }
}

/// Fold one optional sample into (avg, min, max) running aggregates. The
/// previous average over `old_count` packets is taken as 0 when unset,
/// matching the incremental-mean update used for both SNR and RSSI.
fn fold_sample(
    sample: Option<f64>,
    old_count: i64,
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
) -> (Option<f64>, Option<f64>, Option<f64>) {
    match sample {
        Some(value) => {
            let new_avg = (avg.unwrap_or(0.0) * old_count as f64 + value) / (old_count + 1) as f64;
            let new_min = Some(min.unwrap_or(value).min(value));
            let new_max = Some(max.unwrap_or(value).max(value));
            (Some(new_avg), new_min, new_max)
        }
        None => (avg, min, max),
    }
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<LinkRow> {
    Ok(LinkRow {
        id: row.get("id")?,
        source_node_id: row.get("source_node_id")?,
        neighbor_node_id: row.get("neighbor_node_id")?,
        first_heard_utc: row.get("first_heard_utc")?,
        last_heard_utc: row.get("last_heard_utc")?,
        total_packets: row.get("total_packets")?,
        avg_snr: row.get("avg_snr")?,
        avg_rssi: row.get("avg_rssi")?,
        min_snr: row.get("min_snr")?,
        max_snr: row.get("max_snr")?,
        min_rssi: row.get("min_rssi")?,
        max_rssi: row.get("max_rssi")?,
        link_quality_score: row.get("link_quality_score")?,
        is_active: row.get("is_active")?,
        last_hop_count: row.get("last_hop_count")?,
    })
}

/// Periodic staleness sweep. Runs until the shutdown broadcast fires.
pub async fn run_sweeper(
    store: Arc<TopologyStore>,
    timeout_minutes: i64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.mark_inactive_links(timeout_minutes).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Topology sweep: marked {} links inactive", n),
                    Err(e) => tracing::warn!("Topology sweep failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Topology sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_link_quality_formula() {
        // SNR 4.0 -> 60, RSSI -80 -> 44.4, 1 packet -> reliability 2.
        let score = link_quality(Some(4.0), Some(-80.0), 1);
        assert!((score - 42.16).abs() < 1e-9);

        // Both components clamp to their bounds.
        assert_eq!(link_quality(Some(100.0), Some(0.0), 1000), 100.0);
        assert_eq!(link_quality(Some(-40.0), Some(-200.0), 0), 0.0);

        // Missing components contribute nothing.
        let snr_only = link_quality(Some(0.0), None, 1);
        assert!((snr_only - (50.0 * 0.4 + 0.4)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_running_mean_matches_arithmetic_mean() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = TopologyStore::new(db);

        let samples = [4.0, -2.5, 10.0, 0.5, 7.25];
        for snr in samples {
            store
                .update_link("!11111111", "!22222222", Some(snr), Some(-80), Some(0))
                .await
                .unwrap();
        }

        let links = store.get_topology(false).await.unwrap();
        assert_eq!(links.len(), 1);
        let link = &links[0];
        let expected: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((link.avg_snr.unwrap() - expected).abs() < 1e-9);
        assert_eq!(link.total_packets, samples.len() as i64);
        assert_eq!(link.min_snr, Some(-2.5));
        assert_eq!(link.max_snr, Some(10.0));
        assert!(link.min_snr.unwrap() <= link.avg_snr.unwrap());
        assert!(link.avg_snr.unwrap() <= link.max_snr.unwrap());
    }

    #[tokio::test]
    async fn test_missing_sample_leaves_aggregates() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = TopologyStore::new(db);

        store
            .update_link("!11111111", "!22222222", Some(6.0), None, Some(1))
            .await
            .unwrap();
        store
            .update_link("!11111111", "!22222222", None, Some(-90), Some(1))
            .await
            .unwrap();

        let link = &store.get_topology(false).await.unwrap()[0];
        assert_eq!(link.avg_snr, Some(6.0));
        assert_eq!(link.avg_rssi, Some(-90.0));
        assert_eq!(link.total_packets, 2);
    }

    #[tokio::test]
    async fn test_staleness_sweep_boundaries() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = TopologyStore::new(db.clone());

        store
            .update_link("!aaaaaaaa", "!bbbbbbbb", Some(1.0), None, Some(0))
            .await
            .unwrap();
        store
            .update_link("!cccccccc", "!dddddddd", Some(1.0), None, Some(0))
            .await
            .unwrap();

        // Age one edge to 61 minutes, the other to 59.
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE network_topology SET last_heard_utc = ? WHERE source_node_id = '!aaaaaaaa'",
                params![now_ms() - 61 * 60 * 1000],
            )
            .unwrap();
            conn.execute(
                "UPDATE network_topology SET last_heard_utc = ? WHERE source_node_id = '!cccccccc'",
                params![now_ms() - 59 * 60 * 1000],
            )
            .unwrap();
        }

        let flipped = store.mark_inactive_links(60).await.unwrap();
        assert_eq!(flipped, 1);

        let links = store.get_topology(false).await.unwrap();
        for link in links {
            match link.source_node_id.as_str() {
                "!aaaaaaaa" => assert!(!link.is_active),
                "!cccccccc" => assert!(link.is_active),
                other => panic!("unexpected edge source {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_update_reactivates_stale_link() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = TopologyStore::new(db.clone());

        store
            .update_link("!aaaaaaaa", "!bbbbbbbb", Some(1.0), None, Some(0))
            .await
            .unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE network_topology SET last_heard_utc = ?",
                params![now_ms() - 2 * 60 * 60 * 1000],
            )
            .unwrap();
        }
        store.mark_inactive_links(60).await.unwrap();
        assert!(store.get_topology(true).await.unwrap().is_empty());

        store
            .update_link("!aaaaaaaa", "!bbbbbbbb", Some(2.0), None, Some(0))
            .await
            .unwrap();
        assert_eq!(store.get_topology(true).await.unwrap().len(), 1);
    }
}
