//! hostgrid-provision — the instance lifecycle orchestrator.
//!
//! Drives tenant instances through their lifecycle against a set of
//! narrow infrastructure clients:
//!
//! ```text
//! create ──▶ Pending ──queue──▶ QueueConsumer ──▶ ProvisioningPipeline (9 steps)
//!                                                   ├─ ok   ──▶ Running
//!                                                   └─ fail ──▶ Failed
//! Running ◀──resume── Suspended ◀──suspend── Running
//! any live ──destroy──▶ DestructionPipeline (7 steps, best-effort)
//!                        └─▶ tombstone worker id + Destroyed (version-checked)
//! ```
//!
//! Every external call is bounded by the configured per-call timeout and
//! aborts as soon as the operation's [`CancellationToken`] fires.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod clients;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod sim;
pub mod steps;

pub use clients::{
    Clients, ContainerRuntime, ContainerSpec, DatabaseManager, DnsProvider, InstanceNotifier,
    ObjectStorage, ProxyManager,
};
pub use error::{conflict, OrchestratorError, OrchestratorResult};
pub use orchestrator::{CreateInstance, Orchestrator, ProvisionOutcome, PROVISIONING_ABANDONED};
pub use pipeline::{DestructionPipeline, DestructionReport, ProvisioningPipeline};
pub use queue::{ConsumerOutcome, MemoryQueue, ProvisioningQueue, QueueConsumer};
pub use sim::SimulatedBackend;
pub use steps::{StepContext, DESTRUCTION_STEPS, PROVISIONING_STEPS};
