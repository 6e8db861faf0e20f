//! Relay attribution
//!
//! Multi-hop packets carry only the low 8 bits of the relaying node's
//! identifier. The resolver maps that byte back to a full identity using
//! the driver's in-memory node table first and the persisted node set as a
//! fallback, breaking ties by recency, then signal, then packet volume.
//! When nothing qualifies the caller stores the raw byte as a decimal
//! marker, which downstream views filter out by its missing `!` prefix.

use crate::node_store::NodeStore;
use crate::radio::DriverNode;
use std::cmp::Ordering;
use std::sync::Arc;

/// A resolved relay identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelay {
    pub node_id: String,
    pub name: String,
}

#[derive(Debug)]
struct Candidate {
    node_id: String,
    name: String,
    last_heard: Option<i64>,
    snr: Option<f64>,
    total_packets: i64,
}

pub struct RelayResolver {
    nodes: Arc<NodeStore>,
}

impl RelayResolver {
    pub fn new(nodes: Arc<NodeStore>) -> Self {
        Self { nodes }
    }

    /// Resolve a partial relay byte for a packet from `source_node_id`.
    ///
    /// A candidate qualifies when the low byte of its number equals the
    /// partial value and it is not the source itself (a packet cannot relay
    /// through its own sender). The driver table is authoritative; the
    /// store is only consulted when the driver has no match.
    pub async fn resolve(
        &self,
        partial_id: u32,
        source_node_id: &str,
        driver_nodes: &[DriverNode],
    ) -> Option<ResolvedRelay> {
        let wanted = (partial_id & 0xff) as u8;

        let mut matches: Vec<Candidate> = driver_nodes
            .iter()
            .filter(|node| (node.num & 0xff) as u8 == wanted)
            .filter(|node| node.canonical_id() != source_node_id)
            .map(|node| Candidate {
                node_id: node.canonical_id(),
                name: node.display_name(),
                last_heard: node.last_heard,
                snr: node.snr,
                total_packets: 0,
            })
            .collect();

        if matches.is_empty() {
            matches = self.store_candidates(wanted, source_node_id).await;
        }

        if matches.is_empty() {
            tracing::debug!(
                "No relay match for {:#04x} (packet from {})",
                wanted,
                source_node_id
            );
            return None;
        }

        matches.sort_by(rank_candidates);

        if matches.len() > 1 {
            let others: Vec<&str> = matches[1..].iter().map(|m| m.name.as_str()).collect();
            tracing::info!(
                "Multiple relay matches for {:#04x}: chose {}, also matched: {}",
                wanted,
                matches[0].name,
                others.join(", ")
            );
        }

        let best = &matches[0];
        Some(ResolvedRelay {
            node_id: best.node_id.clone(),
            name: best.name.clone(),
        })
    }

    async fn store_candidates(&self, wanted: u8, source_node_id: &str) -> Vec<Candidate> {
        let nodes = match self.nodes.get_all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!("Relay store fallback query failed: {}", e);
                return Vec::new();
            }
        };

        nodes
            .into_iter()
            .filter(|node| node.node_id != source_node_id)
            .filter(|node| {
                node.node_num
                    .map(|num| (num as u32 & 0xff) as u8 == wanted)
                    .unwrap_or(false)
            })
            .map(|node| Candidate {
                name: node.display_name().to_string(),
                node_id: node.node_id,
                last_heard: None,
                snr: None,
                total_packets: node.total_packets_received,
            })
            .collect()
    }
}

/// Best candidate first: most recently heard, then best SNR, then highest
/// stored packet count. Absent values rank below any present value.
fn rank_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.last_heard
        .cmp(&a.last_heard)
        .then_with(|| {
            let a_snr = a.snr.unwrap_or(f64::NEG_INFINITY);
            let b_snr = b.snr.unwrap_or(f64::NEG_INFINITY);
            b_snr.partial_cmp(&a_snr).unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.total_packets.cmp(&a.total_packets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use crate::node_store::NodeUpdate;
    use tempfile::NamedTempFile;

    fn driver_node(num: u32, last_heard: Option<i64>, snr: Option<f64>) -> DriverNode {
        DriverNode {
            num,
            last_heard,
            snr,
            ..Default::default()
        }
    }

    fn resolver() -> (RelayResolver, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        (RelayResolver::new(Arc::new(NodeStore::new(db))), temp_file)
    }

    #[tokio::test]
    async fn test_single_candidate_resolves() {
        let (resolver, _db_file) = resolver();
        let nodes = vec![driver_node(0xaabbccdd, Some(100), Some(5.0))];

        let resolved = resolver.resolve(0xdd, "!11111111", &nodes).await.unwrap();
        assert_eq!(resolved.node_id, "!aabbccdd");
    }

    #[tokio::test]
    async fn test_source_node_is_excluded() {
        let (resolver, _db_file) = resolver();
        // Only match shares the source's low byte AND identity.
        let nodes = vec![driver_node(0x111111dd, Some(100), Some(5.0))];

        let resolved = resolver.resolve(0xdd, "!111111dd", &nodes).await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_no_candidate_returns_none() {
        let (resolver, _db_file) = resolver();
        let nodes = vec![driver_node(0xaabbcc01, Some(100), Some(5.0))];
        assert!(resolver.resolve(0xdd, "!11111111", &nodes).await.is_none());
    }

    #[tokio::test]
    async fn test_tie_broken_by_last_heard_then_snr() {
        let (resolver, _db_file) = resolver();

        // Two nodes share the low byte; the more recently heard one wins.
        let nodes = vec![
            driver_node(0xaabbccdd, Some(100), Some(-3.0)),
            driver_node(0x220000dd, Some(500), Some(-10.0)),
        ];
        let resolved = resolver.resolve(0xdd, "!11111111", &nodes).await.unwrap();
        assert_eq!(resolved.node_id, "!220000dd");

        // Swap recency and the other wins.
        let nodes = vec![
            driver_node(0xaabbccdd, Some(900), Some(-3.0)),
            driver_node(0x220000dd, Some(500), Some(-10.0)),
        ];
        let resolved = resolver.resolve(0xdd, "!11111111", &nodes).await.unwrap();
        assert_eq!(resolved.node_id, "!aabbccdd");

        // Equal recency falls through to SNR.
        let nodes = vec![
            driver_node(0xaabbccdd, Some(500), Some(-3.0)),
            driver_node(0x220000dd, Some(500), Some(-10.0)),
        ];
        let resolved = resolver.resolve(0xdd, "!11111111", &nodes).await.unwrap();
        assert_eq!(resolved.node_id, "!aabbccdd");
    }

    #[tokio::test]
    async fn test_store_fallback_ranks_by_packet_count() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let nodes = Arc::new(NodeStore::new(db));
        let resolver = RelayResolver::new(nodes.clone());

        for (node_id, num, packets) in [
            ("!aabbccdd", 0xaabbccddu32, 5),
            ("!220000dd", 0x220000ddu32, 12),
        ] {
            for _ in 0..packets {
                nodes
                    .upsert_node(&NodeUpdate {
                        node_id: node_id.to_string(),
                        node_num: Some(num as i64),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
            }
        }

        // Empty driver table: the store decides, more packets wins.
        let resolved = resolver.resolve(0xdd, "!11111111", &[]).await.unwrap();
        assert_eq!(resolved.node_id, "!220000dd");
    }
}
