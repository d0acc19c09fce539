//! Health monitor: a background loop that probes every Running instance.
//!
//! The monitor only records observations in the state store. Acting on
//! them is the reconciler's job.

use std::sync::Arc;
use std::time::Duration;

use hostgrid_core::config::HealthConfig;
use hostgrid_state::{InstanceStatus, ProbeObservation, StateResult, StateStore};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checker::HealthVerifier;

/// Tally of one probing sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct HealthMonitor {
    store: StateStore,
    verifier: Arc<dyn HealthVerifier>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(store: StateStore, verifier: Arc<dyn HealthVerifier>, config: HealthConfig) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    /// Probe every Running, non-deleted instance once, concurrently.
    ///
    /// A failed write for one instance is logged and does not affect the
    /// others. Only listing the instances can fail the sweep.
    pub async fn sweep(&self) -> StateResult<SweepSummary> {
        let instances = self
            .store
            .list_instances_with_status(InstanceStatus::Running)?;
        let timeout = self.config.timeout();
        let mut probes = JoinSet::new();

        for instance in instances.into_iter().filter(|i| i.deleted_at.is_none()) {
            let url = self.config.url_for(&instance.domain);
            let verifier = self.verifier.clone();
            let store = self.store.clone();
            probes.spawn(async move {
                let observation = probe_bounded(verifier.as_ref(), &url, timeout).await;
                if !observation.healthy {
                    debug!(instance_id = instance.id, %url, error = ?observation.error, "probe failed");
                }
                match store.record_probe(instance.id, &observation) {
                    Ok(_) => Some(observation.healthy),
                    Err(e) => {
                        error!(instance_id = instance.id, error = %e, "failed to record probe");
                        None
                    }
                }
            });
        }

        let mut summary = SweepSummary::default();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(true)) => {
                    summary.probed += 1;
                    summary.healthy += 1;
                }
                Ok(Some(false)) => {
                    summary.probed += 1;
                    summary.unhealthy += 1;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "probe task panicked"),
            }
        }
        Ok(summary)
    }

    /// Sweep on the configured interval until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep().await {
                        Ok(summary) if summary.unhealthy > 0 => {
                            warn!(probed = summary.probed, unhealthy = summary.unhealthy, "health sweep found unhealthy instances");
                        }
                        Ok(summary) => debug!(probed = summary.probed, "health sweep complete"),
                        Err(e) => error!(error = %e, "health sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Apply the probe timeout even to verifiers that ignore it.
async fn probe_bounded(
    verifier: &dyn HealthVerifier,
    url: &str,
    timeout: Duration,
) -> ProbeObservation {
    match tokio::time::timeout(timeout, verifier.probe(url)).await {
        Ok(observation) => observation,
        Err(_) => ProbeObservation {
            healthy: false,
            latency_ms: None,
            error: Some(format!("timed out after {}ms", timeout.as_millis())),
        },
    }
}
