//! Coverage map
//!
//! Partitions observed reachability inside a time window into direct links
//! (heard with zero hops, or adjacent in a traceroute) and indirect
//! coverage sets centered on each relay, bucketed by hop tier. Only
//! positioned, non-ignored nodes participate; unresolved relay markers were
//! already filtered out by the store queries.

use crate::database::{now_ms, StoreResult};
use crate::node_store::NodeStore;
use crate::probe_log::ProbeLog;
use crate::traceroute_store::TracerouteStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Default observation window in hours.
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Traceroutes examined per build.
const TRACEROUTE_SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct CoveragePosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageNode {
    pub id: String,
    pub name: String,
    pub short_name: String,
    pub position: CoveragePosition,
    pub battery: Option<i64>,
    pub hw_model: Option<String>,
    pub last_heard: i64,
    pub total_packets: i64,
    pub is_mqtt: bool,
    pub direct_link_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectConnection {
    pub from: String,
    pub to: String,
    pub snr: Option<f64>,
    pub rssi: Option<i64>,
    /// Where the evidence came from: `relay-packet`, `traceroute`,
    /// `telemetry`, or a `+`-joined composite.
    pub source: String,
    pub packet_count: i64,
    /// `high` (>= 20 observations), `medium` (>= 5), else `low`.
    pub confidence: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndirectCoverage {
    pub relay_node_id: String,
    /// Hop tier (`1`, `2`, `3`, `4+`) to the senders heard at that
    /// distance through this relay.
    pub tiers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageStats {
    pub total_nodes: usize,
    pub direct_connections: usize,
    pub indirect_coverage: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageMap {
    pub nodes: Vec<CoverageNode>,
    pub direct_connections: Vec<DirectConnection>,
    pub indirect_coverage: Vec<IndirectCoverage>,
    pub hop_distribution: BTreeMap<String, i64>,
    pub stats: CoverageStats,
}

struct DirectAccumulator {
    from: String,
    to: String,
    snr: Option<f64>,
    rssi: Option<i64>,
    source: String,
    packet_count: i64,
}

fn hop_tier(hops: i64) -> &'static str {
    match hops {
        1 => "1",
        2 => "2",
        3 => "3",
        _ => "4+",
    }
}

fn confidence(packet_count: i64) -> &'static str {
    if packet_count >= 20 {
        "high"
    } else if packet_count >= 5 {
        "medium"
    } else {
        "low"
    }
}

/// Unordered pair key for deduplication.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Build the coverage map over the given window.
pub async fn build_coverage_map(
    nodes: &NodeStore,
    traceroutes: &TracerouteStore,
    probes: &ProbeLog,
    window_hours: i64,
) -> StoreResult<CoverageMap> {
    let cutoff = now_ms() - window_hours * 60 * 60 * 1000;

    // Positioned, non-ignored nodes heard inside the window.
    let mut node_lookup: HashMap<String, CoverageNode> = HashMap::new();
    for node in nodes.get_all_nodes().await? {
        if node.is_ignored || node.last_seen_utc < cutoff {
            continue;
        }
        let (Some(lat), Some(lon)) = (node.latitude, node.longitude) else {
            continue;
        };
        let short_name = node
            .short_name
            .clone()
            .unwrap_or_else(|| node.node_id[node.node_id.len().saturating_sub(4)..].to_string());
        node_lookup.insert(
            node.node_id.clone(),
            CoverageNode {
                name: node.display_name().to_string(),
                id: node.node_id.clone(),
                short_name,
                position: CoveragePosition {
                    lat,
                    lon,
                    alt: node.altitude,
                },
                battery: node.battery_level,
                hw_model: node.hardware_model.clone(),
                last_heard: node.last_seen_utc,
                total_packets: node.total_packets_received,
                is_mqtt: node.is_mqtt,
                direct_link_count: 0,
            },
        );
    }

    let mut direct: HashMap<(String, String), DirectAccumulator> = HashMap::new();
    let mut indirect: HashMap<String, BTreeMap<&'static str, HashSet<String>>> = HashMap::new();

    // Sources 1 and 3: relayed packets and completed telemetry responses.
    // Zero hops means the relay heard the source directly; one or more hops
    // credits the relay's indirect coverage set.
    let packet_observations = nodes.relay_observations(cutoff).await?;
    let telemetry_observations = probes.telemetry_relay_observations(cutoff).await?;
    let tagged = packet_observations
        .iter()
        .map(|obs| (obs, "relay-packet"))
        .chain(telemetry_observations.iter().map(|obs| (obs, "telemetry")));

    for (obs, tag) in tagged {
        if !node_lookup.contains_key(&obs.node_id) || !node_lookup.contains_key(&obs.relay_node_id)
        {
            continue;
        }
        if obs.hops_away == 0 {
            fold_direct(
                &mut direct,
                &obs.node_id,
                &obs.relay_node_id,
                obs.rx_snr,
                obs.rx_rssi,
                tag,
            );
        } else {
            indirect
                .entry(obs.relay_node_id.clone())
                .or_default()
                .entry(hop_tier(obs.hops_away))
                .or_default()
                .insert(obs.node_id.clone());
        }
    }

    // Source 2: traceroutes. Every consecutive pair in a route is a direct
    // link by construction.
    for trace in traceroutes.get_all_traceroutes(TRACEROUTE_SCAN_LIMIT).await? {
        if trace.received_at_utc < cutoff {
            continue;
        }
        let snr_towards = trace.snr_towards.as_deref().unwrap_or(&[]);
        for (i, pair) in trace.route.windows(2).enumerate() {
            if !node_lookup.contains_key(&pair[0]) || !node_lookup.contains_key(&pair[1]) {
                continue;
            }
            let snr = snr_towards.get(i).copied();
            fold_direct(&mut direct, &pair[0], &pair[1], snr, None, "traceroute");
        }
    }

    // Direct-link counts per node.
    for acc in direct.values() {
        for endpoint in [&acc.from, &acc.to] {
            if let Some(node) = node_lookup.get_mut(endpoint.as_str()) {
                node.direct_link_count += 1;
            }
        }
    }

    let direct_connections: Vec<DirectConnection> = direct
        .into_values()
        .map(|acc| DirectConnection {
            confidence: confidence(acc.packet_count).to_string(),
            from: acc.from,
            to: acc.to,
            snr: acc.snr,
            rssi: acc.rssi,
            source: acc.source,
            packet_count: acc.packet_count,
        })
        .collect();

    let indirect_coverage: Vec<IndirectCoverage> = indirect
        .into_iter()
        .map(|(relay_node_id, tiers)| IndirectCoverage {
            relay_node_id,
            tiers: tiers
                .into_iter()
                .map(|(tier, senders)| {
                    let mut senders: Vec<String> = senders.into_iter().collect();
                    senders.sort();
                    (tier.to_string(), senders)
                })
                .collect(),
        })
        .collect();

    let mut hop_distribution = BTreeMap::new();
    for (hops, count) in nodes.hop_histogram_since(cutoff).await? {
        let tier = if hops <= 0 { "0" } else { hop_tier(hops) };
        *hop_distribution.entry(tier.to_string()).or_insert(0) += count;
    }

    let stats = CoverageStats {
        total_nodes: node_lookup.len(),
        direct_connections: direct_connections.len(),
        indirect_coverage: indirect_coverage.len(),
    };

    let mut coverage_nodes: Vec<CoverageNode> = node_lookup.into_values().collect();
    coverage_nodes.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(CoverageMap {
        nodes: coverage_nodes,
        direct_connections,
        indirect_coverage,
        hop_distribution,
        stats,
    })
}

/// Fold one direct-link observation into the deduplicated pair map.
fn fold_direct(
    direct: &mut HashMap<(String, String), DirectAccumulator>,
    from: &str,
    to: &str,
    snr: Option<f64>,
    rssi: Option<i64>,
    tag: &str,
) {
    let key = pair_key(from, to);
    match direct.get_mut(&key) {
        Some(acc) => {
            acc.packet_count += 1;
            if acc.snr.is_none() {
                acc.snr = snr;
            }
            if acc.rssi.is_none() {
                acc.rssi = rssi;
            }
            merge_source(&mut acc.source, tag);
        }
        None => {
            direct.insert(
                key,
                DirectAccumulator {
                    from: from.to_string(),
                    to: to.to_string(),
                    snr,
                    rssi,
                    source: tag.to_string(),
                    packet_count: 1,
                },
            );
        }
    }
}

/// Record that another evidence source confirmed a link.
fn merge_source(existing: &mut String, tag: &str) {
    if !existing.split('+').any(|part| part == tag) {
        existing.push('+');
        existing.push_str(tag);
    }
}
