//! Telemetry scheduler
//!
//! Same loop shape as the traceroute scheduler, probing for device metrics
//! instead of routes. Candidate staleness is measured against the most
//! recent *completed* telemetry attempt, and nodes with a recent
//! traceroute are skipped by default since the traceroute already
//! exercised the path.

use crate::config::{AutoTelemetryConfig, AutoTracerouteConfig};
use crate::probe_log::{ProbeKind, ProbeLog};
use crate::radio::RadioSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct TelemetryScheduler {
    probes: Arc<ProbeLog>,
    radio: Arc<RadioSlot>,
    config: AutoTelemetryConfig,
    /// The traceroute section owns `traceroute_age_hours`, shared here for
    /// the recent-traceroute skip.
    traceroute_age_hours: i64,
    cycle_in_progress: AtomicBool,
}

impl TelemetryScheduler {
    pub fn new(
        probes: Arc<ProbeLog>,
        radio: Arc<RadioSlot>,
        config: AutoTelemetryConfig,
        traceroute_config: &AutoTracerouteConfig,
    ) -> Self {
        Self {
            probes,
            radio,
            config,
            traceroute_age_hours: traceroute_config.traceroute_age_hours,
            cycle_in_progress: AtomicBool::new(false),
        }
    }

    /// Scheduler loop with a one-interval warm-up before the first cycle.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Auto-telemetry is disabled");
            return;
        }

        let period = Duration::from_secs(self.config.interval_minutes * 60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tracing::info!(
            "Auto-telemetry enabled: checking every {} minutes",
            self.config.interval_minutes
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Telemetry scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One probe cycle; colliding ticks are dropped.
    pub async fn run_cycle(&self) {
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Auto-telemetry: cycle already in progress, skipping");
            return;
        }

        self.cycle().await;
        self.cycle_in_progress.store(false, Ordering::SeqCst);
    }

    async fn cycle(&self) {
        let Some(radio) = self.radio.current() else {
            tracing::warn!("Auto-telemetry: no radio interface available");
            return;
        };

        match self
            .probes
            .timeout_stale_attempts(ProbeKind::Telemetry, self.config.timeout_seconds)
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!("Auto-telemetry: marked {} stale requests as timed out", n),
            Err(e) => tracing::warn!("Auto-telemetry: failed to timeout stale requests: {}", e),
        }

        let candidates = match self
            .probes
            .nodes_needing_telemetry(
                self.config.active_threshold_minutes,
                self.config.request_age_hours,
                self.config.exclude_mqtt_nodes,
                self.config.skip_nodes_with_recent_traceroute,
                self.traceroute_age_hours,
                self.config.max_per_cycle,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Auto-telemetry: candidate query failed: {}", e);
                return;
            }
        };

        if candidates.is_empty() {
            tracing::info!("Auto-telemetry: no nodes need telemetry requests at this time");
            return;
        }

        tracing::info!(
            "Auto-telemetry: sending requests to {} nodes",
            candidates.len()
        );

        for (i, candidate) in candidates.iter().enumerate() {
            tracing::info!(
                "Auto-telemetry: requesting from {} ({})",
                candidate.display_name(),
                candidate.node_id
            );

            if let Err(e) = radio.send_telemetry_request(candidate.node_num as u32) {
                tracing::warn!(
                    "Auto-telemetry: failed to send to {}: {}",
                    candidate.node_id,
                    e
                );
            }

            // Logged regardless of send outcome; accounting stays honest.
            if let Err(e) = self
                .probes
                .insert_attempt(
                    ProbeKind::Telemetry,
                    &candidate.node_id,
                    Some(candidate.display_name()),
                )
                .await
            {
                tracing::warn!(
                    "Auto-telemetry: failed to log attempt for {}: {}",
                    candidate.node_id,
                    e
                );
            }

            if i + 1 < candidates.len() && self.config.delay_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.delay_seconds)).await;
            }
        }

        tracing::info!(
            "Auto-telemetry: cycle complete, sent {} requests",
            candidates.len()
        );
    }
}
