//! The provisioning queue and its consumer.
//!
//! Delivery is at-least-once: the same id may arrive several times, and
//! ids of instances that were destroyed meanwhile may still arrive. The
//! consumer relies on the store's atomic Pending → Provisioning claim to
//! run the pipeline at most once per instance.

use std::sync::Arc;

use async_trait::async_trait;
use hostgrid_core::config::FailurePolicy;
use hostgrid_state::{InstanceId, InstanceStatus};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::{Orchestrator, ProvisionOutcome};

#[async_trait]
pub trait ProvisioningQueue: Send + Sync {
    async fn enqueue(&self, id: InstanceId) -> anyhow::Result<()>;

    /// Wait for the next id. `None` once the queue is closed.
    async fn dequeue(&self) -> Option<InstanceId>;
}

/// Unbounded in-process queue.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<InstanceId>,
    rx: Mutex<mpsc::UnboundedReceiver<InstanceId>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningQueue for MemoryQueue {
    async fn enqueue(&self, id: InstanceId) -> anyhow::Result<()> {
        self.tx
            .send(id)
            .map_err(|_| anyhow::anyhow!("provisioning queue is closed"))
    }

    async fn dequeue(&self) -> Option<InstanceId> {
        self.rx.lock().await.recv().await
    }
}

/// What handling one queue item amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerOutcome {
    Provisioned,
    /// Duplicate or stale delivery; the instance was not Pending.
    Skipped(InstanceStatus),
    /// Provisioning failed and the instance was left Failed.
    Failed,
    /// Provisioning failed and the instance was destroyed per policy.
    FailedAndDestroyed,
    /// The item could not be handled at all (store error, missing instance).
    Errored,
}

pub struct QueueConsumer {
    orchestrator: Arc<Orchestrator>,
    policy: FailurePolicy,
}

impl QueueConsumer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let policy = orchestrator.config().provisioning.on_failure;
        Self {
            orchestrator,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Re-enqueue every Pending instance. Run once at startup to pick up
    /// work whose queue message was lost.
    pub async fn recover(&self) -> OrchestratorResult<usize> {
        let pending = self
            .orchestrator
            .store()
            .list_instances_with_status(InstanceStatus::Pending)?;
        for instance in &pending {
            self.orchestrator
                .queue()
                .enqueue(instance.id)
                .await
                .map_err(|e| OrchestratorError::Queue(format!("{e:#}")))?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "re-enqueued pending instances");
        }
        Ok(pending.len())
    }

    /// Handle one delivered id. Never fails; every fault is logged.
    pub async fn handle(&self, id: InstanceId, cancel: &CancellationToken) -> ConsumerOutcome {
        let err = match self.orchestrator.provision(id, cancel).await {
            Ok(ProvisionOutcome::Provisioned(_)) => return ConsumerOutcome::Provisioned,
            Ok(ProvisionOutcome::Skipped(status)) => {
                debug!(instance_id = id, %status, "duplicate or stale delivery");
                return ConsumerOutcome::Skipped(status);
            }
            Err(e) => e,
        };

        let failed = matches!(
            self.orchestrator.store().get_instance(id),
            Ok(Some(ref i)) if i.status == InstanceStatus::Failed
        );
        if !failed {
            error!(instance_id = id, error = %err, "could not handle queue item");
            return ConsumerOutcome::Errored;
        }

        match self.policy {
            FailurePolicy::Leave => {
                warn!(instance_id = id, error = %err, "provisioning failed, left for operator");
                ConsumerOutcome::Failed
            }
            FailurePolicy::Destroy => {
                warn!(instance_id = id, error = %err, "provisioning failed, destroying");
                match self.orchestrator.destroy(id, cancel).await {
                    Ok(_) => ConsumerOutcome::FailedAndDestroyed,
                    Err(e) => {
                        error!(instance_id = id, error = %e, "cleanup after failed provisioning did not finish");
                        ConsumerOutcome::Failed
                    }
                }
            }
        }
    }

    /// Consume the queue until `shutdown` fires or the queue closes.
    ///
    /// Items are handled concurrently. On shutdown, in-flight pipelines are
    /// cancelled and awaited before returning. A cancelled run ends Failed
    /// with every handle it created on record, ready for destroy.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let cancel = CancellationToken::new();
        let mut in_flight = JoinSet::new();
        info!(policy = ?self.policy, "queue consumer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("queue consumer shutting down");
                    break;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                next = self.orchestrator.queue().dequeue() => {
                    let Some(id) = next else {
                        info!("provisioning queue closed");
                        break;
                    };
                    let consumer = self.clone();
                    let cancel = cancel.child_token();
                    in_flight.spawn(async move {
                        consumer.handle(id, &cancel).await;
                    });
                }
            }
        }

        cancel.cancel();
        while in_flight.join_next().await.is_some() {}
        debug!("queue consumer stopped");
    }
}
