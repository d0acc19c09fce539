//! Provisioning and destruction pipelines.
//!
//! Both run a fixed list of [`PipelineStep`]s and write a
//! [`ProvisioningEvent`] before and after every step. They differ in how
//! they treat a failing step: provisioning stops and marks the instance
//! Failed, destruction records the failure and carries on.

use std::sync::Arc;

use hostgrid_state::{
    EventPhase, EventStatus, Instance, InstanceId, InstanceStatus, ProvisioningEvent, StateStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{conflict, OrchestratorError, OrchestratorResult};
use crate::steps::{destruction_steps, provisioning_steps, PipelineStep, StepContext, StepRun};

/// Step name of the event written when every provisioning step succeeded.
pub const PROVISIONING_COMPLETE: &str = "provisioning_complete";

/// Append an audit row. A failed audit write is logged, never fatal.
pub(crate) fn log_event(
    store: &StateStore,
    instance_id: InstanceId,
    phase: EventPhase,
    step: &str,
    status: EventStatus,
    error: Option<String>,
) {
    let event = ProvisioningEvent {
        instance_id,
        phase,
        step_name: step.to_string(),
        status,
        error_message: error,
        created_at_ms: epoch_millis(),
    };
    if let Err(e) = store.append_event(&event) {
        error!(instance_id, step, error = %e, "failed to append provisioning event");
    }
}

/// Drives a claimed instance from Provisioning to Running, or to Failed.
pub struct ProvisioningPipeline {
    ctx: Arc<StepContext>,
    steps: Vec<Box<dyn PipelineStep>>,
}

impl ProvisioningPipeline {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self::with_steps(ctx, provisioning_steps())
    }

    pub fn with_steps(ctx: Arc<StepContext>, steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self { ctx, steps }
    }

    /// Run every step once, in order.
    ///
    /// `instance` must already be in Provisioning (see
    /// [`StateStore::claim_for_provisioning`]). On the first failing step
    /// the failure is recorded, the instance is marked Failed and the
    /// step's error is returned; later steps never run. Nothing is torn
    /// down here.
    ///
    /// Before each step the stored instance is compared with the claimed
    /// one. If its status or version moved, the run stops with
    /// `Conflict(CONCURRENT_MODIFICATION)` and leaves the status alone.
    pub async fn run(
        &self,
        instance: Instance,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Instance> {
        let id = instance.id;
        let store = &self.ctx.store;
        let infra = store.get_infrastructure(id)?;
        let mut run = StepRun::new(instance, infra, cancel.clone());
        info!(instance_id = id, domain = %run.instance.domain, "provisioning started");

        for step in &self.steps {
            let name = step.name();
            if let Some(current) = self.taken_over(&run.instance)? {
                warn!(
                    instance_id = id,
                    step = name,
                    status = %current.status,
                    "instance changed during provisioning, stopping"
                );
                log_event(
                    store,
                    id,
                    EventPhase::Provision,
                    name,
                    EventStatus::Failed,
                    Some(format!("instance is now {}", current.status)),
                );
                return Err(OrchestratorError::Conflict(conflict::CONCURRENT_MODIFICATION));
            }
            log_event(store, id, EventPhase::Provision, name, EventStatus::Started, None);

            let outcome = if cancel.is_cancelled() {
                Err(OrchestratorError::Cancelled)
            } else {
                step.execute(&self.ctx, &mut run).await
            };

            if let Err(e) = outcome {
                log_event(
                    store,
                    id,
                    EventPhase::Provision,
                    name,
                    EventStatus::Failed,
                    Some(e.to_string()),
                );
                error!(instance_id = id, step = name, error = %e, "provisioning step failed");
                self.mark_failed(&run.instance);
                return Err(e);
            }

            log_event(store, id, EventPhase::Provision, name, EventStatus::Succeeded, None);
            debug!(instance_id = id, step = name, "provisioning step succeeded");
        }

        let running = store.transition_status(id, run.instance.version, InstanceStatus::Running)?;
        log_event(
            store,
            id,
            EventPhase::Provision,
            PROVISIONING_COMPLETE,
            EventStatus::Succeeded,
            None,
        );
        info!(instance_id = id, worker_id = ?running.worker_id, "instance running");
        Ok(running)
    }

    /// The stored instance, if someone else has written to it since this
    /// run claimed it.
    fn taken_over(&self, claimed: &Instance) -> OrchestratorResult<Option<Instance>> {
        let current = self
            .ctx
            .store
            .get_instance(claimed.id)?
            .ok_or_else(|| OrchestratorError::not_found(claimed.id))?;
        if current.version == claimed.version && current.status == InstanceStatus::Provisioning {
            Ok(None)
        } else {
            Ok(Some(current))
        }
    }

    fn mark_failed(&self, instance: &Instance) {
        if let Err(e) =
            self.ctx
                .store
                .transition_status(instance.id, instance.version, InstanceStatus::Failed)
        {
            warn!(instance_id = instance.id, error = %e, "could not mark instance failed");
        }
    }
}

/// Steps that failed during one teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestructionReport {
    pub failed_steps: Vec<&'static str>,
}

impl DestructionReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Best-effort teardown of everything recorded for an instance.
pub struct DestructionPipeline {
    ctx: Arc<StepContext>,
    steps: Vec<Box<dyn PipelineStep>>,
}

impl DestructionPipeline {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self::with_steps(ctx, destruction_steps())
    }

    pub fn with_steps(ctx: Arc<StepContext>, steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self { ctx, steps }
    }

    /// Run every step regardless of earlier failures.
    ///
    /// Step errors are logged and recorded as Failed events, then
    /// swallowed. Cancellation stops the run before the next step. The
    /// instance's status is not touched; the caller finalizes it.
    pub async fn run(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DestructionReport> {
        let id = instance.id;
        let store = &self.ctx.store;
        let infra = store.get_infrastructure(id)?;
        let mut run = StepRun::new(instance.clone(), infra, cancel.clone());
        let mut report = DestructionReport::default();
        info!(instance_id = id, domain = %instance.domain, "destruction started");

        for step in &self.steps {
            let name = step.name();
            if cancel.is_cancelled() {
                warn!(instance_id = id, step = name, "destruction cancelled");
                return Err(OrchestratorError::Cancelled);
            }
            log_event(store, id, EventPhase::Destroy, name, EventStatus::Started, None);
            match step.execute(&self.ctx, &mut run).await {
                Ok(()) => {
                    log_event(store, id, EventPhase::Destroy, name, EventStatus::Succeeded, None);
                    debug!(instance_id = id, step = name, "destruction step succeeded");
                }
                Err(e) => {
                    log_event(
                        store,
                        id,
                        EventPhase::Destroy,
                        name,
                        EventStatus::Failed,
                        Some(e.to_string()),
                    );
                    warn!(instance_id = id, step = name, error = %e, "destruction step failed, continuing");
                    report.failed_steps.push(name);
                }
            }
        }

        info!(
            instance_id = id,
            failed = report.failed_steps.len(),
            "destruction finished"
        );
        Ok(report)
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
