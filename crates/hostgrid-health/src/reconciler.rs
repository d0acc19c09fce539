//! Instance reconciler.
//!
//! Compares what the store says should exist with what has been observed
//! and acts on the difference:
//!
//! - Running instances whose consecutive probe failures exceed the
//!   threshold are escalated, and suspended when policy says so.
//! - Running instances whose container stopped or whose database vanished
//!   are reported as drifted.
//! - Infrastructure rows that still hold a handle but belong to no live
//!   instance are stamped orphaned for cleanup.
//! - Provisioning instances with no pipeline activity for longer than
//!   `stall_after` are marked Failed, so a run lost with its process can be
//!   destroyed.
//!
//! Every per-instance fault is logged and skipped; one bad instance never
//! stalls the pass.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hostgrid_core::config::ReconcilerConfig;
use hostgrid_provision::{Orchestrator, OrchestratorResult};
use hostgrid_state::{Instance, InstanceId, InstanceStatus};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const VERIFY_CONTAINER: &str = "verify_container";
const VERIFY_DATABASE: &str = "verify_database";

/// Reason passed to the tenant when the reconciler suspends an instance.
pub const UNHEALTHY_REASON: &str = "health checks failing";

/// Observed state that no longer matches a Running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    ContainerNotRunning,
    DatabaseMissing,
}

/// What one reconciliation pass found and did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Running instances past the failure threshold.
    pub escalated: Vec<InstanceId>,
    /// Escalated instances that were suspended.
    pub suspended: Vec<InstanceId>,
    pub drifted: Vec<(InstanceId, Drift)>,
    /// Infrastructure rows newly stamped orphaned.
    pub orphaned: Vec<InstanceId>,
    /// Provisioning runs given up on and marked Failed.
    pub stalled: Vec<InstanceId>,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.escalated.is_empty()
            && self.drifted.is_empty()
            && self.orphaned.is_empty()
            && self.stalled.is_empty()
    }
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config().reconciler.clone();
        Self {
            orchestrator,
            config,
        }
    }

    /// Run one full pass.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> OrchestratorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.fail_stalled(&mut report)?;
        self.escalate_unhealthy(cancel, &mut report).await?;
        self.check_drift(cancel, &mut report).await?;
        self.flag_orphans(&mut report)?;
        Ok(report)
    }

    /// Give up on Provisioning instances whose last pipeline event is
    /// older than `stall_after`.
    fn fail_stalled(&self, report: &mut ReconcileReport) -> OrchestratorResult<()> {
        let store = self.orchestrator.store();
        let stall_after = self.config.stall_after().as_millis() as u64;
        let now = epoch_millis();

        for instance in store.list_instances_with_status(InstanceStatus::Provisioning)? {
            let id = instance.id;
            let last_activity = match store.list_events(id) {
                Ok(events) => events
                    .iter()
                    .map(|e| e.created_at_ms)
                    .fold(instance.created_at.saturating_mul(1000), u64::max),
                Err(e) => {
                    error!(instance_id = id, error = %e, "could not load provisioning events");
                    continue;
                }
            };
            let idle_ms = now.saturating_sub(last_activity);
            if idle_ms < stall_after {
                continue;
            }

            let reason = format!("no provisioning activity for {}s", idle_ms / 1000);
            match self.orchestrator.abandon_provisioning(&instance, &reason) {
                Ok(_) => report.stalled.push(id),
                Err(e) => warn!(instance_id = id, error = %e, "could not abandon stalled provisioning"),
            }
        }
        Ok(())
    }

    async fn escalate_unhealthy(
        &self,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> OrchestratorResult<()> {
        let store = self.orchestrator.store();
        let threshold = self.config.failure_threshold;

        for record in store.list_health()? {
            if record.consecutive_failures <= threshold {
                continue;
            }
            let id = record.instance_id;
            let instance = match store.get_instance(id) {
                Ok(Some(instance)) if instance.status == InstanceStatus::Running => instance,
                Ok(_) => continue,
                Err(e) => {
                    error!(instance_id = id, error = %e, "could not load unhealthy instance");
                    continue;
                }
            };

            warn!(
                instance_id = id,
                domain = %instance.domain,
                failures = record.consecutive_failures,
                threshold,
                error = ?record.error_message,
                "instance unhealthy past threshold"
            );
            report.escalated.push(id);
        }

        if self.config.suspend_unhealthy {
            let escalated = report.escalated.clone();
            self.suspend_all(&escalated, cancel, report).await;
        }
        Ok(())
    }

    /// Suspend instances concurrently, at most `max_concurrent_suspends`
    /// at a time, since each one waits out the grace period.
    async fn suspend_all(
        &self,
        ids: &[InstanceId],
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) {
        let limit = self.config.max_concurrent_suspends.max(1);
        let mut suspensions = JoinSet::new();

        for &id in ids {
            if suspensions.len() >= limit {
                if let Some(joined) = suspensions.join_next().await {
                    record_suspension(joined, report);
                }
            }
            let orchestrator = self.orchestrator.clone();
            let cancel = cancel.clone();
            suspensions.spawn(async move {
                let outcome = orchestrator.suspend(id, UNHEALTHY_REASON, &cancel).await;
                (id, outcome)
            });
        }
        while let Some(joined) = suspensions.join_next().await {
            record_suspension(joined, report);
        }
        report.suspended.sort_unstable();
    }

    async fn check_drift(
        &self,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> OrchestratorResult<()> {
        let store = self.orchestrator.store();
        let ctx = self.orchestrator.context();

        for instance in store.list_instances_with_status(InstanceStatus::Running)? {
            let id = instance.id;
            let infra = match store.get_infrastructure(id) {
                Ok(Some(infra)) => infra,
                Ok(None) => continue,
                Err(e) => {
                    error!(instance_id = id, error = %e, "could not load infrastructure");
                    continue;
                }
            };

            if let Some(container_id) = &infra.container_id {
                let running = ctx
                    .call(
                        VERIFY_CONTAINER,
                        cancel,
                        ctx.clients.containers.verify_container_running(container_id),
                    )
                    .await;
                match running {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(instance_id = id, %container_id, "container not running");
                        report.drifted.push((id, Drift::ContainerNotRunning));
                    }
                    Err(e) => warn!(instance_id = id, error = %e, "container check failed"),
                }
            }

            if let Some(database) = &infra.database_name {
                let exists = ctx
                    .call(
                        VERIFY_DATABASE,
                        cancel,
                        ctx.clients.databases.verify_database_exists(database),
                    )
                    .await;
                match exists {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(instance_id = id, %database, "database missing");
                        report.drifted.push((id, Drift::DatabaseMissing));
                    }
                    Err(e) => warn!(instance_id = id, error = %e, "database check failed"),
                }
            }
        }
        Ok(())
    }

    fn flag_orphans(&self, report: &mut ReconcileReport) -> OrchestratorResult<()> {
        let store = self.orchestrator.store();
        let now = epoch_secs();

        for infra in store.list_infrastructure()? {
            if infra.orphaned_at.is_some() || !infra.holds_resources() {
                continue;
            }
            let id = infra.instance_id;
            let owned = match store.get_instance(id) {
                Ok(instance) => instance.is_some_and(|i| i.status.is_live()),
                Err(e) => {
                    error!(instance_id = id, error = %e, "could not load instance for orphan check");
                    continue;
                }
            };
            if owned {
                continue;
            }
            match store.update_infrastructure(id, |i| i.orphaned_at = Some(now)) {
                Ok(_) => {
                    warn!(instance_id = id, "infrastructure orphaned");
                    report.orphaned.push(id);
                }
                Err(e) => error!(instance_id = id, error = %e, "could not flag orphan"),
            }
        }
        Ok(())
    }

    /// Reconcile on the configured interval until `shutdown` fires. A pass
    /// in progress at shutdown is cancelled and awaited.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(
            interval_ms = interval.as_millis() as u64,
            threshold = self.config.failure_threshold,
            suspend = self.config.suspend_unhealthy,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            let cancel = CancellationToken::new();
            let pass = self.reconcile(&cancel);
            tokio::pin!(pass);
            let mut stopping = false;
            let outcome = tokio::select! {
                outcome = &mut pass => outcome,
                _ = shutdown.changed() => {
                    stopping = true;
                    cancel.cancel();
                    pass.await
                }
            };

            match outcome {
                Ok(report) if report.is_quiet() => debug!("reconcile pass clean"),
                Ok(report) => info!(
                    escalated = report.escalated.len(),
                    suspended = report.suspended.len(),
                    drifted = report.drifted.len(),
                    orphaned = report.orphaned.len(),
                    stalled = report.stalled.len(),
                    "reconcile pass complete"
                ),
                Err(e) => error!(error = %e, "reconcile pass failed"),
            }
            if stopping {
                break;
            }
        }
        info!("reconciler shutting down");
    }
}

fn record_suspension(
    joined: Result<(InstanceId, OrchestratorResult<Instance>), tokio::task::JoinError>,
    report: &mut ReconcileReport,
) {
    match joined {
        Ok((id, Ok(_))) => report.suspended.push(id),
        Ok((id, Err(e))) => error!(instance_id = id, error = %e, "could not suspend unhealthy instance"),
        Err(e) => error!(error = %e, "suspend task panicked"),
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hostgrid_core::{HostgridConfig, SnowflakeGenerator};
    use hostgrid_crypto::SecretKey;
    use hostgrid_provision::sim::ops;
    use hostgrid_provision::{
        CreateInstance, MemoryQueue, SimulatedBackend, StepContext, PROVISIONING_ABANDONED,
    };
    use hostgrid_state::{EventStatus, ProbeObservation, ProvisionClaim, StateStore};

    use super::*;

    struct Setup {
        store: StateStore,
        sim: Arc<SimulatedBackend>,
        orchestrator: Arc<Orchestrator>,
    }

    fn config(threshold: u32, suspend_unhealthy: bool) -> HostgridConfig {
        let mut config = HostgridConfig::development();
        config.provisioning.suspend_grace = "10ms".into();
        config.reconciler.failure_threshold = threshold;
        config.reconciler.suspend_unhealthy = suspend_unhealthy;
        config.reconciler.interval = "20ms".into();
        config
    }

    fn setup(threshold: u32, suspend_unhealthy: bool) -> Setup {
        setup_with(config(threshold, suspend_unhealthy))
    }

    fn setup_with(config: HostgridConfig) -> Setup {
        let store = StateStore::open_in_memory().unwrap();
        let sim = SimulatedBackend::new();
        let ctx = Arc::new(StepContext::new(
            store.clone(),
            sim.clients(),
            Arc::new(config),
            SecretKey::generate(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            ctx,
            SnowflakeGenerator::new(1).unwrap(),
            Arc::new(MemoryQueue::new()),
        ));
        Setup {
            store,
            sim,
            orchestrator,
        }
    }

    impl Setup {
        async fn running(&self, subdomain: &str) -> Instance {
            let created = self.pending(subdomain).await;
            self.orchestrator
                .provision(created.id, &CancellationToken::new())
                .await
                .unwrap();
            self.store.get_instance(created.id).unwrap().unwrap()
        }

        async fn pending(&self, subdomain: &str) -> Instance {
            self.orchestrator
                .create(CreateInstance {
                    owner_id: "owner-1".into(),
                    subdomain: subdomain.into(),
                    display_name: String::new(),
                    tier: "pro".into(),
                })
                .await
                .unwrap()
        }

        /// Claim an instance for provisioning with no pipeline behind the
        /// claim, as a crashed process leaves it.
        async fn claimed_and_left(&self, subdomain: &str) -> Instance {
            let created = self.pending(subdomain).await;
            match self.store.claim_for_provisioning(created.id).unwrap() {
                ProvisionClaim::Claimed(instance) => instance,
                ProvisionClaim::NotEligible(status) => panic!("not claimable: {status}"),
            }
        }

        fn fail_probes(&self, id: InstanceId, times: u32) {
            for _ in 0..times {
                self.store
                    .record_probe(
                        id,
                        &ProbeObservation {
                            healthy: false,
                            latency_ms: None,
                            error: Some("connection refused".into()),
                        },
                    )
                    .unwrap();
            }
        }

        fn reconciler(&self) -> Reconciler {
            Reconciler::new(self.orchestrator.clone())
        }
    }

    #[tokio::test]
    async fn escalates_only_past_the_threshold() {
        let s = setup(3, false);
        let at = s.running("atx").await;
        let past = s.running("past").await;
        s.fail_probes(at.id, 3);
        s.fail_probes(past.id, 4);

        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.escalated, vec![past.id]);
        assert!(report.suspended.is_empty());
        assert_eq!(
            s.store.get_instance(past.id).unwrap().unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn suspends_when_policy_says_so() {
        let s = setup(1, true);
        let sick = s.running("sick").await;
        s.fail_probes(sick.id, 2);

        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.suspended, vec![sick.id]);
        assert_eq!(
            s.store.get_instance(sick.id).unwrap().unwrap().status,
            InstanceStatus::Suspended
        );
        assert_eq!(
            s.sim.notices(),
            vec![("sick.hostgrid.local".to_string(), UNHEALTHY_REASON.to_string())]
        );

        // Suspended instances are no longer escalated.
        let again = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(again.escalated.is_empty());
    }

    #[tokio::test]
    async fn suspensions_wait_out_their_grace_periods_together() {
        let mut config = config(1, true);
        config.provisioning.suspend_grace = "300ms".into();
        config.reconciler.max_concurrent_suspends = 4;
        let s = setup_with(config);
        let mut sick = Vec::new();
        for name in ["sick-a", "sick-b", "sick-c"] {
            let instance = s.running(name).await;
            s.fail_probes(instance.id, 2);
            sick.push(instance.id);
        }
        sick.sort_unstable();

        let started = std::time::Instant::now();
        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
        assert_eq!(report.suspended, sick);
        for id in sick {
            assert_eq!(
                s.store.get_instance(id).unwrap().unwrap().status,
                InstanceStatus::Suspended
            );
        }
    }

    #[tokio::test]
    async fn concurrent_suspensions_are_bounded() {
        let mut config = config(1, true);
        config.provisioning.suspend_grace = "150ms".into();
        config.reconciler.max_concurrent_suspends = 1;
        let s = setup_with(config);
        for name in ["sick-a", "sick-b"] {
            let instance = s.running(name).await;
            s.fail_probes(instance.id, 2);
        }

        let started = std::time::Instant::now();
        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(report.suspended.len(), 2);
    }

    #[tokio::test]
    async fn abandons_provisioning_that_went_quiet() {
        let mut config = config(3, false);
        config.reconciler.stall_after = "0s".into();
        let s = setup_with(config);
        let stuck = s.claimed_and_left("stuck").await;

        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.stalled, vec![stuck.id]);
        assert!(!report.is_quiet());
        assert_eq!(
            s.store.get_instance(stuck.id).unwrap().unwrap().status,
            InstanceStatus::Failed
        );
        let abandoned: Vec<_> = s
            .store
            .list_events(stuck.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == EventStatus::Failed)
            .map(|e| e.step_name)
            .collect();
        assert_eq!(abandoned, vec![PROVISIONING_ABANDONED.to_string()]);

        // Failed instances can be cleaned up.
        let destroyed = s
            .orchestrator
            .destroy(stuck.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(destroyed.status, InstanceStatus::Destroyed);
    }

    #[tokio::test]
    async fn recent_provisioning_is_left_alone() {
        let s = setup(3, false);
        let busy = s.claimed_and_left("busy").await;

        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(report.stalled.is_empty());
        assert_eq!(
            s.store.get_instance(busy.id).unwrap().unwrap().status,
            InstanceStatus::Provisioning
        );
    }

    #[tokio::test]
    async fn reports_container_and_database_drift() {
        let s = setup(3, false);
        let healthy = s.running("fine").await;
        let crashed = s.running("crashed").await;
        let lost = s.running("lost").await;
        let infra = |id| s.store.get_infrastructure(id).unwrap().unwrap();
        s.sim.crash_container(infra(crashed.id).container_id.as_deref().unwrap());
        s.sim.lose_database(infra(lost.id).database_name.as_deref().unwrap());

        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.drifted,
            vec![
                (crashed.id, Drift::ContainerNotRunning),
                (lost.id, Drift::DatabaseMissing)
            ]
        );
        assert!(!report.drifted.iter().any(|(id, _)| *id == healthy.id));
    }

    #[tokio::test]
    async fn failed_verification_is_not_drift() {
        let s = setup(3, false);
        s.running("acme").await;
        s.sim.fail(ops::VERIFY_CONTAINER_RUNNING);
        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(report.drifted.is_empty());
    }

    #[tokio::test]
    async fn flags_leftovers_of_destroyed_instances_once() {
        let s = setup(3, false);
        let kept = s.running("kept").await;
        let gone = s.running("gone").await;
        s.orchestrator
            .destroy(gone.id, &CancellationToken::new())
            .await
            .unwrap();

        // The database outlives destruction until dropped.
        let report = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.orphaned, vec![gone.id]);
        assert!(s.store.get_infrastructure(gone.id).unwrap().unwrap().orphaned_at.is_some());
        assert!(s.store.get_infrastructure(kept.id).unwrap().unwrap().orphaned_at.is_none());

        let again = s.reconciler().reconcile(&CancellationToken::new()).await.unwrap();
        assert!(again.orphaned.is_empty());
    }

    #[tokio::test]
    async fn fully_released_rows_are_not_orphans() {
        let s = setup(3, false);
        let gone = s.running("gone").await;
        let cancel = CancellationToken::new();
        s.orchestrator.destroy(gone.id, &cancel).await.unwrap();
        s.orchestrator.drop_database(gone.id, &cancel).await.unwrap();

        let report = s.reconciler().reconcile(&cancel).await.unwrap();
        assert!(report.orphaned.is_empty());
        assert!(report.is_quiet());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let s = setup(3, false);
        let reconciler = Arc::new(s.reconciler());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.sim.call_count(ops::VERIFY_CONTAINER_RUNNING), 0);
    }
}
