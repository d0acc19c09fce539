//! The nine provisioning steps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hostgrid_core::config::ProvisioningConfig;
use hostgrid_core::subdomain::{fqdn, validate_subdomain};
use hostgrid_crypto::{hash_token, wrap_dek_base64, InstanceSecrets, SecretCipher, SecretKey};
use hostgrid_state::{Instance, InstanceId, InstanceInfrastructure};
use tracing::debug;

use super::{required, PipelineStep, StepContext, StepRun};
use crate::clients::ContainerSpec;
use crate::error::{conflict, OrchestratorError, OrchestratorResult};

pub const VALIDATE_SUBDOMAIN: &str = "validate_subdomain";
pub const ENFORCE_QUOTA: &str = "enforce_quota";
pub const GENERATE_SECRETS: &str = "generate_secrets";
pub const ALLOCATE_WORKER_ID: &str = "allocate_worker_id";
pub const CREATE_NETWORK: &str = "create_network";
pub const PROVISION_DATABASE: &str = "provision_database";
pub const PROVISION_STORAGE: &str = "provision_storage";
pub const START_CONTAINER: &str = "start_container";
pub const CONFIGURE_ROUTING: &str = "configure_routing";

pub fn network_name(id: InstanceId) -> String {
    format!("hg-net-{id}")
}

pub fn database_name(id: InstanceId) -> String {
    format!("hg_{id}")
}

pub fn bucket_name(id: InstanceId) -> String {
    format!("hg-{id}")
}

pub fn container_name(id: InstanceId) -> String {
    format!("hg-app-{id}")
}

pub fn upstream(id: InstanceId, config: &ProvisioningConfig) -> String {
    format!("http://{}:{}", container_name(id), config.app_port)
}

/// Container definition for a tenant. The bootstrap token is only handed
/// to the first container an instance ever runs.
pub(crate) fn container_spec(
    step: &'static str,
    config: &ProvisioningConfig,
    instance: &Instance,
    infra: &InstanceInfrastructure,
    database_password: &str,
    storage_secret_key: &str,
    bootstrap_token: Option<&str>,
) -> OrchestratorResult<ContainerSpec> {
    let mut env = BTreeMap::from([
        ("HOSTGRID_INSTANCE_ID".to_string(), instance.id.to_string()),
        ("HOSTGRID_DOMAIN".to_string(), instance.domain.clone()),
        ("PORT".to_string(), config.app_port.to_string()),
        (
            "DATABASE_NAME".to_string(),
            required(step, "database_name", &infra.database_name)?.to_string(),
        ),
        ("DATABASE_PASSWORD".to_string(), database_password.to_string()),
        (
            "STORAGE_BUCKET".to_string(),
            required(step, "storage_bucket", &infra.storage_bucket)?.to_string(),
        ),
        (
            "STORAGE_ACCESS_KEY".to_string(),
            required(step, "storage_access_key", &infra.storage_access_key)?.to_string(),
        ),
        ("STORAGE_SECRET_KEY".to_string(), storage_secret_key.to_string()),
    ]);
    if let Some(worker_id) = instance.worker_id {
        env.insert("HOSTGRID_WORKER_ID".to_string(), worker_id.to_string());
    }
    if let Some(token) = bootstrap_token {
        env.insert("BOOTSTRAP_TOKEN".to_string(), token.to_string());
    }
    Ok(ContainerSpec {
        name: container_name(instance.id),
        image: config.app_image.clone(),
        network_id: required(step, "network_id", &infra.network_id)?.to_string(),
        env,
    })
}

/// Format check plus confirmation that the domain index points at this
/// instance.
pub struct ValidateSubdomain;

#[async_trait]
impl PipelineStep for ValidateSubdomain {
    fn name(&self) -> &'static str {
        VALIDATE_SUBDOMAIN
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let instance = &run.instance;
        validate_subdomain(&instance.subdomain)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        let expected = fqdn(&instance.subdomain, &ctx.config.provisioning.base_domain);
        if instance.domain != expected {
            return Err(OrchestratorError::Validation(format!(
                "domain '{}' does not match subdomain '{}'",
                instance.domain, instance.subdomain
            )));
        }
        match ctx.store.domain_owner(&instance.domain)? {
            Some(owner) if owner == instance.id => Ok(()),
            _ => Err(OrchestratorError::Conflict(conflict::SUBDOMAIN_TAKEN)),
        }
    }
}

pub struct EnforceQuota;

#[async_trait]
impl PipelineStep for EnforceQuota {
    fn name(&self) -> &'static str {
        ENFORCE_QUOTA
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let instance = &run.instance;
        let quota = ctx.config.tier(&instance.tier).ok_or_else(|| {
            OrchestratorError::Validation(format!("unknown tier '{}'", instance.tier))
        })?;
        let ahead =
            ctx.store
                .count_live_instances_before(&instance.owner_id, &instance.tier, instance.id)?;
        if ahead >= quota.max_instances {
            return Err(OrchestratorError::QuotaExceeded {
                tier: instance.tier.clone(),
                limit: quota.max_instances,
            });
        }
        Ok(())
    }
}

/// Fresh credentials plus a fresh DEK. Only ciphertext, the wrapped DEK
/// and the token hash reach the store.
pub struct GenerateSecrets;

#[async_trait]
impl PipelineStep for GenerateSecrets {
    fn name(&self) -> &'static str {
        GENERATE_SECRETS
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let secrets = InstanceSecrets::generate();
        let dek = SecretKey::generate();
        let cipher = SecretCipher::new(&dek)?;

        let wrapped = wrap_dek_base64(&dek, ctx.kek())?;
        let password_enc = cipher.encrypt_field(&secrets.database_password)?;
        let storage_secret_enc = cipher.encrypt_field(&secrets.storage_secret_key)?;
        let token_hash = hash_token(&secrets.bootstrap_token);
        let access_key = secrets.storage_access_key.clone();

        run.record(ctx, move |infra| {
            infra.wrapped_dek = Some(wrapped);
            infra.database_password_enc = Some(password_enc);
            infra.storage_access_key = Some(access_key);
            infra.storage_secret_key_enc = Some(storage_secret_enc);
            infra.bootstrap_token_hash = Some(token_hash);
        })?;
        run.secrets = Some(secrets);
        Ok(())
    }
}

pub struct AllocateWorkerId;

#[async_trait]
impl PipelineStep for AllocateWorkerId {
    fn name(&self) -> &'static str {
        ALLOCATE_WORKER_ID
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let worker_id = ctx.store.allocate_worker_id(run.instance.id)?;
        run.instance.worker_id = Some(worker_id);
        debug!(instance_id = run.instance.id, worker_id, "worker id assigned");
        Ok(())
    }
}

pub struct CreateNetwork;

#[async_trait]
impl PipelineStep for CreateNetwork {
    fn name(&self) -> &'static str {
        CREATE_NETWORK
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let name = network_name(run.instance.id);
        let network_id = ctx
            .call(
                CREATE_NETWORK,
                &run.cancel,
                ctx.clients.containers.create_network(&name),
            )
            .await?;
        run.record(ctx, |infra| infra.network_id = Some(network_id))
    }
}

pub struct ProvisionDatabase;

#[async_trait]
impl PipelineStep for ProvisionDatabase {
    fn name(&self) -> &'static str {
        PROVISION_DATABASE
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let name = database_name(run.instance.id);
        let password = run.secrets(PROVISION_DATABASE)?.database_password.clone();
        ctx.call(
            PROVISION_DATABASE,
            &run.cancel,
            ctx.clients.databases.create_database(&name, &password),
        )
        .await?;
        run.record(ctx, |infra| infra.database_name = Some(name))
    }
}

pub struct ProvisionStorage;

#[async_trait]
impl PipelineStep for ProvisionStorage {
    fn name(&self) -> &'static str {
        PROVISION_STORAGE
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let bucket = bucket_name(run.instance.id);
        let secrets = run.secrets(PROVISION_STORAGE)?;
        let access_key = secrets.storage_access_key.clone();
        let secret_key = secrets.storage_secret_key.clone();
        ctx.call(
            PROVISION_STORAGE,
            &run.cancel,
            ctx.clients
                .storage
                .create_bucket(&bucket, &access_key, &secret_key),
        )
        .await?;
        run.record(ctx, |infra| infra.storage_bucket = Some(bucket))
    }
}

pub struct StartContainer;

#[async_trait]
impl PipelineStep for StartContainer {
    fn name(&self) -> &'static str {
        START_CONTAINER
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let secrets = run.secrets(START_CONTAINER)?;
        let spec = container_spec(
            START_CONTAINER,
            &ctx.config.provisioning,
            &run.instance,
            &run.infra,
            secrets.database_password.as_str(),
            secrets.storage_secret_key.as_str(),
            Some(secrets.bootstrap_token.as_str()),
        )?;
        let container_id = ctx
            .call(
                START_CONTAINER,
                &run.cancel,
                ctx.clients.containers.start_container(&spec),
            )
            .await?;
        run.record(ctx, |infra| infra.container_id = Some(container_id))
    }
}

/// DNS first, then the proxy route. Each handle is persisted as soon as
/// it exists.
pub struct ConfigureRouting;

#[async_trait]
impl PipelineStep for ConfigureRouting {
    fn name(&self) -> &'static str {
        CONFIGURE_ROUTING
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let provisioning = &ctx.config.provisioning;
        let domain = run.instance.domain.clone();

        let record_id = ctx
            .call(
                CONFIGURE_ROUTING,
                &run.cancel,
                ctx.clients
                    .dns
                    .create_a_record(&domain, &provisioning.ingress_address),
            )
            .await?;
        run.record(ctx, |infra| infra.dns_record_id = Some(record_id))?;

        let upstream = upstream(run.instance.id, provisioning);
        let route_id = ctx
            .call(
                CONFIGURE_ROUTING,
                &run.cancel,
                ctx.clients.proxy.create_route(&domain, &upstream),
            )
            .await?;
        run.record(ctx, |infra| infra.proxy_route_id = Some(route_id))
    }
}
