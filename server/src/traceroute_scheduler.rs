//! Traceroute scheduler
//!
//! Periodically selects active nodes without a recent traceroute and sends
//! paced route-discovery probes through the connected radio. Each send is
//! logged as a pending attempt; the ingest correlator closes it when the
//! response arrives, and the next cycle times out whatever went
//! unanswered.

use crate::config::AutoTracerouteConfig;
use crate::probe_log::{ProbeKind, ProbeLog};
use crate::radio::RadioSlot;
use crate::traceroute_store::TracerouteStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct TracerouteScheduler {
    traceroutes: Arc<TracerouteStore>,
    probes: Arc<ProbeLog>,
    radio: Arc<RadioSlot>,
    config: AutoTracerouteConfig,
    cycle_in_progress: AtomicBool,
}

impl TracerouteScheduler {
    pub fn new(
        traceroutes: Arc<TracerouteStore>,
        probes: Arc<ProbeLog>,
        radio: Arc<RadioSlot>,
        config: AutoTracerouteConfig,
    ) -> Self {
        Self {
            traceroutes,
            probes,
            radio,
            config,
            cycle_in_progress: AtomicBool::new(false),
        }
    }

    /// Scheduler loop. The first cycle runs one full interval after start,
    /// giving the radio time to settle after connect.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Auto-traceroute is disabled");
            return;
        }

        let period = Duration::from_secs(self.config.interval_minutes * 60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tracing::info!(
            "Auto-traceroute enabled: checking every {} minutes",
            self.config.interval_minutes
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Traceroute scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One probe cycle. A tick landing while a cycle is still pacing its
    /// sends is dropped, not queued.
    pub async fn run_cycle(&self) {
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Auto-traceroute: cycle already in progress, skipping");
            return;
        }

        self.cycle().await;
        self.cycle_in_progress.store(false, Ordering::SeqCst);
    }

    async fn cycle(&self) {
        let Some(radio) = self.radio.current() else {
            tracing::warn!("Auto-traceroute: no radio interface available");
            return;
        };

        match self
            .probes
            .timeout_stale_attempts(ProbeKind::Traceroute, self.config.timeout_seconds)
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!("Auto-traceroute: marked {} stale attempts as timed out", n),
            Err(e) => tracing::warn!("Auto-traceroute: failed to timeout stale attempts: {}", e),
        }

        let candidates = match self
            .traceroutes
            .nodes_needing_traceroute(
                self.config.active_threshold_minutes,
                self.config.traceroute_age_hours,
                self.config.exclude_mqtt_nodes,
                self.config.max_per_cycle,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Auto-traceroute: candidate query failed: {}", e);
                return;
            }
        };

        if candidates.is_empty() {
            tracing::info!("Auto-traceroute: no nodes need traceroutes at this time");
            return;
        }

        tracing::info!(
            "Auto-traceroute: sending traceroutes to {} nodes",
            candidates.len()
        );

        for (i, candidate) in candidates.iter().enumerate() {
            tracing::info!(
                "Auto-traceroute: sending to {} ({}) - last traceroute: {}",
                candidate.display_name(),
                candidate.node_id,
                candidate
                    .last_probe_utc
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );

            if let Err(e) =
                radio.send_traceroute(candidate.node_num as u32, self.config.hop_limit)
            {
                tracing::warn!(
                    "Auto-traceroute: failed to send to {}: {}",
                    candidate.node_id,
                    e
                );
            }

            // The attempt row is written even when the send errored, so the
            // sent-count accounting stays honest.
            if let Err(e) = self
                .probes
                .insert_attempt(
                    ProbeKind::Traceroute,
                    &candidate.node_id,
                    Some(candidate.display_name()),
                )
                .await
            {
                tracing::warn!(
                    "Auto-traceroute: failed to log attempt for {}: {}",
                    candidate.node_id,
                    e
                );
            }

            // Pace the sends, except after the last target.
            if i + 1 < candidates.len() && self.config.delay_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.delay_seconds)).await;
            }
        }

        tracing::info!(
            "Auto-traceroute: cycle complete, sent {} traceroutes",
            candidates.len()
        );
    }
}
