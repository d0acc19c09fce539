//! Lifecycle operations on instances.
//!
//! Every status write is version-checked against the instance as read at
//! the start of the operation, so two operations racing on one instance
//! cannot both win. Coordination goes through the store only; several
//! orchestrators may share one database.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hostgrid_core::subdomain::{fqdn, validate_subdomain};
use hostgrid_core::{HostgridConfig, SnowflakeGenerator};
use hostgrid_crypto::{unwrap_dek_base64, SecretCipher};
use hostgrid_state::{
    EventPhase, EventStatus, Instance, InstanceId, InstanceStatus, ProvisionClaim, StateStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clients::Clients;
use crate::error::{conflict, OrchestratorError, OrchestratorResult};
use crate::pipeline::{log_event, DestructionPipeline, ProvisioningPipeline};
use crate::queue::ProvisioningQueue;
use crate::steps::provision::container_spec;
use crate::steps::{required, StepContext};

const SUSPEND: &str = "suspend";
const RESUME: &str = "resume";
const DROP_DATABASE: &str = "drop_database";

/// Step name of the event written when a stalled run is given up on.
pub const PROVISIONING_ABANDONED: &str = "provisioning_abandoned";

/// A request to create a new instance.
#[derive(Debug, Clone)]
pub struct CreateInstance {
    pub owner_id: String,
    pub subdomain: String,
    pub display_name: String,
    pub tier: String,
}

/// What [`Orchestrator::provision`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// The pipeline ran to completion; the instance is Running.
    Provisioned(Instance),
    /// The instance was not Pending, so nothing ran.
    Skipped(InstanceStatus),
}

pub struct Orchestrator {
    ctx: Arc<StepContext>,
    ids: SnowflakeGenerator,
    queue: Arc<dyn ProvisioningQueue>,
    provisioning: ProvisioningPipeline,
    destruction: DestructionPipeline,
}

impl Orchestrator {
    pub fn new(
        ctx: Arc<StepContext>,
        ids: SnowflakeGenerator,
        queue: Arc<dyn ProvisioningQueue>,
    ) -> Self {
        Self {
            provisioning: ProvisioningPipeline::new(ctx.clone()),
            destruction: DestructionPipeline::new(ctx.clone()),
            ctx,
            ids,
            queue,
        }
    }

    pub fn context(&self) -> &Arc<StepContext> {
        &self.ctx
    }

    pub fn store(&self) -> &StateStore {
        &self.ctx.store
    }

    pub fn clients(&self) -> &Clients {
        &self.ctx.clients
    }

    pub fn config(&self) -> &HostgridConfig {
        &self.ctx.config
    }

    pub fn queue(&self) -> &Arc<dyn ProvisioningQueue> {
        &self.queue
    }

    fn require(&self, id: InstanceId) -> OrchestratorResult<Instance> {
        self.ctx
            .store
            .get_instance(id)?
            .ok_or_else(|| OrchestratorError::not_found(id))
    }

    /// Persist a new Pending instance and enqueue it for provisioning.
    ///
    /// The domain is claimed atomically with the insert, so a collision
    /// fails with `Conflict(SUBDOMAIN_TAKEN)` before any step runs.
    pub async fn create(&self, request: CreateInstance) -> OrchestratorResult<Instance> {
        validate_subdomain(&request.subdomain)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        if request.owner_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("owner id is required".to_string()));
        }
        if self.config().tier(&request.tier).is_none() {
            return Err(OrchestratorError::Validation(format!(
                "unknown tier '{}'",
                request.tier
            )));
        }

        let display_name = if request.display_name.trim().is_empty() {
            request.subdomain.clone()
        } else {
            request.display_name
        };
        let instance = Instance {
            id: self.ids.next_id()?,
            owner_id: request.owner_id,
            domain: fqdn(&request.subdomain, &self.config().provisioning.base_domain),
            subdomain: request.subdomain,
            display_name,
            tier: request.tier,
            status: InstanceStatus::Pending,
            worker_id: None,
            version: 0,
            created_at: epoch_secs(),
            deleted_at: None,
        };
        self.ctx.store.insert_instance(&instance)?;
        info!(instance_id = instance.id, domain = %instance.domain, tier = %instance.tier, "instance created");

        if let Err(e) = self.queue.enqueue(instance.id).await {
            warn!(
                instance_id = instance.id,
                error = %e,
                "enqueue failed, instance stays pending until queue recovery"
            );
        }
        Ok(instance)
    }

    /// Claim a Pending instance and run the provisioning pipeline on it.
    ///
    /// Safe under duplicate delivery: only the caller that wins the claim
    /// runs the pipeline, everyone else gets [`ProvisionOutcome::Skipped`].
    pub async fn provision(
        &self,
        id: InstanceId,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<ProvisionOutcome> {
        match self.ctx.store.claim_for_provisioning(id)? {
            ProvisionClaim::NotEligible(status) => {
                debug!(instance_id = id, %status, "not pending, skipping provisioning");
                Ok(ProvisionOutcome::Skipped(status))
            }
            ProvisionClaim::Claimed(instance) => {
                let running = self.provisioning.run(instance, cancel).await?;
                Ok(ProvisionOutcome::Provisioned(running))
            }
        }
    }

    /// Tear an instance down and mark it Destroyed.
    ///
    /// The teardown is best-effort. Afterwards the worker id is tombstoned
    /// and the status written in one version-checked transaction; a caller
    /// that lost a race with another destroy gets
    /// `Conflict(CONCURRENT_MODIFICATION)`. A cancelled teardown leaves the
    /// instance in its previous status so it can be destroyed again.
    ///
    /// An instance in Provisioning belongs to a pipeline run and is refused
    /// with `Conflict(INVALID_STATE)` until that run ends, or until the
    /// reconciler marks an abandoned run Failed.
    pub async fn destroy(
        &self,
        id: InstanceId,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Instance> {
        let instance = self.require(id)?;
        match instance.status {
            InstanceStatus::Destroyed => {
                return Err(OrchestratorError::Conflict(conflict::INSTANCE_DESTROYED));
            }
            InstanceStatus::Provisioning => {
                debug!(instance_id = id, "provisioning in progress, refusing destroy");
                return Err(OrchestratorError::Conflict(conflict::INVALID_STATE));
            }
            _ => {}
        }

        let report = self.destruction.run(&instance, cancel).await?;
        if cancel.is_cancelled() {
            warn!(instance_id = id, "destruction cancelled before finalizing");
            return Err(OrchestratorError::Cancelled);
        }

        let destroyed = self
            .ctx
            .store
            .finalize_destruction(id, instance.version)
            .map_err(|e| {
                warn!(instance_id = id, error = %e, "could not finalize destruction");
                OrchestratorError::from(e)
            })?;
        info!(
            instance_id = id,
            failed_steps = ?report.failed_steps,
            "instance destroyed"
        );
        Ok(destroyed)
    }

    /// Stop a Running instance's container and mark it Suspended.
    ///
    /// The tenant is told first and given the configured grace period to
    /// warn its own clients. The wait ends early only if `cancel` fires.
    pub async fn suspend(
        &self,
        id: InstanceId,
        reason: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Instance> {
        let instance = self.require(id)?;
        expect_status(&instance, InstanceStatus::Running)?;
        let infra = self.ctx.store.get_infrastructure(id)?.unwrap_or_default();

        let notice = self
            .ctx
            .clients
            .notifier
            .notify_shutting_down(&instance.domain, reason);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            delivered = tokio::time::timeout(self.ctx.call_timeout(), notice) => {
                if delivered.is_err() {
                    warn!(instance_id = id, "shutdown notice timed out");
                }
            }
        }

        let grace = self.config().provisioning.suspend_grace();
        debug!(instance_id = id, grace_ms = grace.as_millis() as u64, "waiting before stop");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep(grace) => {}
        }

        if let Some(container_id) = &infra.container_id {
            self.ctx
                .call(
                    SUSPEND,
                    cancel,
                    self.ctx.clients.containers.stop_container(container_id),
                )
                .await?;
        }

        let suspended =
            self.ctx
                .store
                .transition_status(id, instance.version, InstanceStatus::Suspended)?;
        info!(instance_id = id, %reason, "instance suspended");
        Ok(suspended)
    }

    /// Replace a Suspended instance's container with a fresh one and mark
    /// it Running. Credentials are decrypted from the stored record.
    pub async fn resume(
        &self,
        id: InstanceId,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Instance> {
        let instance = self.require(id)?;
        expect_status(&instance, InstanceStatus::Suspended)?;
        let mut infra = self.ctx.store.get_infrastructure(id)?.ok_or_else(|| {
            OrchestratorError::Infrastructure {
                step: RESUME,
                message: "no infrastructure recorded".to_string(),
            }
        })?;

        let dek = unwrap_dek_base64(required(RESUME, "wrapped_dek", &infra.wrapped_dek)?, self.ctx.kek())?;
        let cipher = SecretCipher::new(&dek)?;
        let password = Zeroizing::new(cipher.decrypt_field(required(
            RESUME,
            "database_password_enc",
            &infra.database_password_enc,
        )?)?);
        let storage_secret = Zeroizing::new(cipher.decrypt_field(required(
            RESUME,
            "storage_secret_key_enc",
            &infra.storage_secret_key_enc,
        )?)?);

        if let Some(old) = infra.container_id.clone() {
            self.ctx
                .call(RESUME, cancel, self.ctx.clients.containers.remove_container(&old))
                .await?;
            infra = self
                .ctx
                .store
                .update_infrastructure(id, |i| i.container_id = None)?;
        }

        let spec = container_spec(
            RESUME,
            &self.config().provisioning,
            &instance,
            &infra,
            &password,
            &storage_secret,
            None,
        )?;
        let container_id = self
            .ctx
            .call(RESUME, cancel, self.ctx.clients.containers.start_container(&spec))
            .await?;
        self.ctx
            .store
            .update_infrastructure(id, |i| i.container_id = Some(container_id))?;

        let running =
            self.ctx
                .store
                .transition_status(id, instance.version, InstanceStatus::Running)?;
        info!(instance_id = id, "instance resumed");
        Ok(running)
    }

    /// Mark a Provisioning instance whose pipeline run is gone as Failed,
    /// so it can be destroyed. A run that is in fact still alive notices
    /// the version change before its next step and stops.
    pub fn abandon_provisioning(
        &self,
        instance: &Instance,
        reason: &str,
    ) -> OrchestratorResult<Instance> {
        expect_status(instance, InstanceStatus::Provisioning)?;
        let failed =
            self.ctx
                .store
                .transition_status(instance.id, instance.version, InstanceStatus::Failed)?;
        log_event(
            &self.ctx.store,
            instance.id,
            EventPhase::Provision,
            PROVISIONING_ABANDONED,
            EventStatus::Failed,
            Some(reason.to_string()),
        );
        warn!(instance_id = instance.id, %reason, "provisioning abandoned");
        Ok(failed)
    }

    /// Drop a destroyed instance's database.
    ///
    /// Kept apart from destruction so tenant data can outlive the rest of
    /// the instance until an operator lets it go.
    pub async fn drop_database(
        &self,
        id: InstanceId,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let instance = self.require(id)?;
        expect_status(&instance, InstanceStatus::Destroyed)?;
        let store = &self.ctx.store;
        let Some(name) = store.get_infrastructure(id)?.and_then(|i| i.database_name) else {
            debug!(instance_id = id, "no database recorded");
            return Ok(());
        };

        log_event(store, id, EventPhase::Destroy, DROP_DATABASE, EventStatus::Started, None);
        let dropped = self
            .ctx
            .call(DROP_DATABASE, cancel, self.ctx.clients.databases.drop_database(&name))
            .await;
        if let Err(e) = dropped {
            log_event(
                store,
                id,
                EventPhase::Destroy,
                DROP_DATABASE,
                EventStatus::Failed,
                Some(e.to_string()),
            );
            return Err(e);
        }
        store.update_infrastructure(id, |i| i.database_name = None)?;
        log_event(store, id, EventPhase::Destroy, DROP_DATABASE, EventStatus::Succeeded, None);
        info!(instance_id = id, database = %name, "database dropped");
        Ok(())
    }
}

fn expect_status(instance: &Instance, expected: InstanceStatus) -> OrchestratorResult<()> {
    match instance.status {
        s if s == expected => Ok(()),
        InstanceStatus::Destroyed => Err(OrchestratorError::Conflict(conflict::INSTANCE_DESTROYED)),
        _ => Err(OrchestratorError::Conflict(conflict::INVALID_STATE)),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
