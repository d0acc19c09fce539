//! Pipeline steps.
//!
//! A step owns exactly one resource. It calls one collaborator through
//! [`StepContext::call`] and persists whatever handle or secret it
//! produced with [`StepRun::record`] before returning, so the
//! infrastructure record always reflects what actually exists.
//!
//! The step order of both pipelines is fixed here, once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostgrid_core::HostgridConfig;
use hostgrid_crypto::{InstanceSecrets, SecretKey};
use hostgrid_state::{Instance, InstanceInfrastructure, StateStore};
use tokio_util::sync::CancellationToken;

use crate::clients::Clients;
use crate::error::{OrchestratorError, OrchestratorResult};

pub mod destroy;
pub mod provision;

/// Provisioning order. Routing is last so nothing is publicly reachable
/// until every dependency exists.
pub const PROVISIONING_STEPS: [&str; 9] = [
    provision::VALIDATE_SUBDOMAIN,
    provision::ENFORCE_QUOTA,
    provision::GENERATE_SECRETS,
    provision::ALLOCATE_WORKER_ID,
    provision::CREATE_NETWORK,
    provision::PROVISION_DATABASE,
    provision::PROVISION_STORAGE,
    provision::START_CONTAINER,
    provision::CONFIGURE_ROUTING,
];

/// Teardown order, the reverse of provisioning. Dropping the database is
/// triggered separately.
pub const DESTRUCTION_STEPS: [&str; 7] = [
    destroy::STOP_CONTAINER,
    destroy::REMOVE_PROXY_ROUTE,
    destroy::REMOVE_DNS_RECORD,
    destroy::REMOVE_CONTAINER,
    destroy::REMOVE_SECRETS,
    destroy::REMOVE_NETWORK,
    destroy::DELETE_STORAGE_BUCKET,
];

pub fn provisioning_steps() -> Vec<Box<dyn PipelineStep>> {
    vec![
        Box::new(provision::ValidateSubdomain),
        Box::new(provision::EnforceQuota),
        Box::new(provision::GenerateSecrets),
        Box::new(provision::AllocateWorkerId),
        Box::new(provision::CreateNetwork),
        Box::new(provision::ProvisionDatabase),
        Box::new(provision::ProvisionStorage),
        Box::new(provision::StartContainer),
        Box::new(provision::ConfigureRouting),
    ]
}

pub fn destruction_steps() -> Vec<Box<dyn PipelineStep>> {
    vec![
        Box::new(destroy::StopContainer),
        Box::new(destroy::RemoveProxyRoute),
        Box::new(destroy::RemoveDnsRecord),
        Box::new(destroy::RemoveContainer),
        Box::new(destroy::RemoveSecrets),
        Box::new(destroy::RemoveNetwork),
        Box::new(destroy::DeleteStorageBucket),
    ]
}

/// One unit of infrastructure creation or teardown.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()>;
}

/// Everything a step may touch that outlives a single run.
pub struct StepContext {
    pub store: StateStore,
    pub clients: Clients,
    pub config: Arc<HostgridConfig>,
    kek: SecretKey,
}

impl StepContext {
    pub fn new(
        store: StateStore,
        clients: Clients,
        config: Arc<HostgridConfig>,
        kek: SecretKey,
    ) -> Self {
        Self {
            store,
            clients,
            config,
            kek,
        }
    }

    pub fn kek(&self) -> &SecretKey {
        &self.kek
    }

    pub fn call_timeout(&self) -> Duration {
        self.config.provisioning.call_timeout()
    }

    /// Issue one external call, bounded by the per-call timeout and
    /// abandoned as soon as `cancel` fires.
    pub async fn call<T, F>(
        &self,
        step: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> OrchestratorResult<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        let timeout = self.call_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            outcome = tokio::time::timeout(timeout, call) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(OrchestratorError::Infrastructure {
                    step,
                    message: format!("{e:#}"),
                }),
                Err(_) => Err(OrchestratorError::Infrastructure {
                    step,
                    message: format!("timed out after {}ms", timeout.as_millis()),
                }),
            },
        }
    }
}

/// Mutable state threaded through one pipeline run.
pub struct StepRun {
    pub instance: Instance,
    /// Latest persisted infrastructure record.
    pub infra: InstanceInfrastructure,
    /// Plaintext secrets, present only between generation and the end of
    /// the provisioning run that generated them.
    pub secrets: Option<InstanceSecrets>,
    pub cancel: CancellationToken,
}

impl StepRun {
    pub fn new(
        instance: Instance,
        infra: Option<InstanceInfrastructure>,
        cancel: CancellationToken,
    ) -> Self {
        let infra = infra.unwrap_or_else(|| InstanceInfrastructure::new(instance.id));
        Self {
            instance,
            infra,
            secrets: None,
            cancel,
        }
    }

    /// Persist a change to the infrastructure record and keep the local
    /// copy in sync.
    pub fn record<F>(&mut self, ctx: &StepContext, apply: F) -> OrchestratorResult<()>
    where
        F: FnOnce(&mut InstanceInfrastructure),
    {
        self.infra = ctx.store.update_infrastructure(self.instance.id, apply)?;
        Ok(())
    }

    pub(crate) fn secrets(&self, step: &'static str) -> OrchestratorResult<&InstanceSecrets> {
        self.secrets
            .as_ref()
            .ok_or_else(|| OrchestratorError::Infrastructure {
                step,
                message: "instance secrets were not generated in this run".to_string(),
            })
    }
}

/// A handle an earlier step should have recorded.
pub(crate) fn required<'a>(
    step: &'static str,
    field: &str,
    value: &'a Option<String>,
) -> OrchestratorResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| OrchestratorError::Infrastructure {
            step,
            message: format!("{field} is not recorded"),
        })
}
