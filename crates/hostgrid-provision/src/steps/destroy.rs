//! The seven destruction steps.
//!
//! Each step clears the handle it released, so after a teardown the
//! infrastructure record lists exactly what is still out there. A step
//! whose handle was never recorded has nothing to do.

use async_trait::async_trait;
use tracing::debug;

use super::{PipelineStep, StepContext, StepRun};
use crate::error::OrchestratorResult;

pub const STOP_CONTAINER: &str = "stop_container";
pub const REMOVE_PROXY_ROUTE: &str = "remove_proxy_route";
pub const REMOVE_DNS_RECORD: &str = "remove_dns_record";
pub const REMOVE_CONTAINER: &str = "remove_container";
pub const REMOVE_SECRETS: &str = "remove_secrets";
pub const REMOVE_NETWORK: &str = "remove_network";
pub const DELETE_STORAGE_BUCKET: &str = "delete_storage_bucket";

fn nothing_to_do(step: &'static str, run: &StepRun) -> OrchestratorResult<()> {
    debug!(instance_id = run.instance.id, step, "no handle recorded, skipping");
    Ok(())
}

pub struct StopContainer;

#[async_trait]
impl PipelineStep for StopContainer {
    fn name(&self) -> &'static str {
        STOP_CONTAINER
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(container_id) = run.infra.container_id.clone() else {
            return nothing_to_do(STOP_CONTAINER, run);
        };
        ctx.call(
            STOP_CONTAINER,
            &run.cancel,
            ctx.clients.containers.stop_container(&container_id),
        )
        .await
    }
}

pub struct RemoveProxyRoute;

#[async_trait]
impl PipelineStep for RemoveProxyRoute {
    fn name(&self) -> &'static str {
        REMOVE_PROXY_ROUTE
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(route_id) = run.infra.proxy_route_id.clone() else {
            return nothing_to_do(REMOVE_PROXY_ROUTE, run);
        };
        ctx.call(
            REMOVE_PROXY_ROUTE,
            &run.cancel,
            ctx.clients.proxy.delete_route(&route_id),
        )
        .await?;
        run.record(ctx, |infra| infra.proxy_route_id = None)
    }
}

pub struct RemoveDnsRecord;

#[async_trait]
impl PipelineStep for RemoveDnsRecord {
    fn name(&self) -> &'static str {
        REMOVE_DNS_RECORD
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(record_id) = run.infra.dns_record_id.clone() else {
            return nothing_to_do(REMOVE_DNS_RECORD, run);
        };
        ctx.call(
            REMOVE_DNS_RECORD,
            &run.cancel,
            ctx.clients.dns.delete_a_record(&record_id),
        )
        .await?;
        run.record(ctx, |infra| infra.dns_record_id = None)
    }
}

pub struct RemoveContainer;

#[async_trait]
impl PipelineStep for RemoveContainer {
    fn name(&self) -> &'static str {
        REMOVE_CONTAINER
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(container_id) = run.infra.container_id.clone() else {
            return nothing_to_do(REMOVE_CONTAINER, run);
        };
        ctx.call(
            REMOVE_CONTAINER,
            &run.cancel,
            ctx.clients.containers.remove_container(&container_id),
        )
        .await?;
        run.record(ctx, |infra| infra.container_id = None)
    }
}

/// Crypto-shred: once the wrapped DEK is gone, every field encrypted
/// under it is unrecoverable, wherever copies of the record ended up.
pub struct RemoveSecrets;

#[async_trait]
impl PipelineStep for RemoveSecrets {
    fn name(&self) -> &'static str {
        REMOVE_SECRETS
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        if !run.infra.holds_secrets() {
            return nothing_to_do(REMOVE_SECRETS, run);
        }
        run.record(ctx, |infra| {
            infra.wrapped_dek = None;
            infra.database_password_enc = None;
            infra.storage_secret_key_enc = None;
            infra.bootstrap_token_hash = None;
        })
    }
}

pub struct RemoveNetwork;

#[async_trait]
impl PipelineStep for RemoveNetwork {
    fn name(&self) -> &'static str {
        REMOVE_NETWORK
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(network_id) = run.infra.network_id.clone() else {
            return nothing_to_do(REMOVE_NETWORK, run);
        };
        ctx.call(
            REMOVE_NETWORK,
            &run.cancel,
            ctx.clients.containers.remove_network(&network_id),
        )
        .await?;
        run.record(ctx, |infra| infra.network_id = None)
    }
}

pub struct DeleteStorageBucket;

#[async_trait]
impl PipelineStep for DeleteStorageBucket {
    fn name(&self) -> &'static str {
        DELETE_STORAGE_BUCKET
    }

    async fn execute(&self, ctx: &StepContext, run: &mut StepRun) -> OrchestratorResult<()> {
        let Some(bucket) = run.infra.storage_bucket.clone() else {
            return nothing_to_do(DELETE_STORAGE_BUCKET, run);
        };
        ctx.call(
            DELETE_STORAGE_BUCKET,
            &run.cancel,
            ctx.clients.storage.delete_bucket(&bucket),
        )
        .await?;
        run.record(ctx, |infra| {
            infra.storage_bucket = None;
            infra.storage_access_key = None;
        })
    }
}
