//! Interfaces to the infrastructure the orchestrator drives.
//!
//! Each trait is the narrow surface one provisioning or destruction step
//! calls. Transports live outside this crate; [`crate::sim`] provides an
//! in-process implementation of all of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

/// What to start for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network_id: String,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create an isolated network; returns its id.
    async fn create_network(&self, name: &str) -> anyhow::Result<String>;
    /// Create and start a container; returns its id.
    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;
    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()>;
    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()>;
    async fn remove_network(&self, network_id: &str) -> anyhow::Result<()>;
    async fn verify_container_running(&self, container_id: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Point `name` at `target`; returns the record id.
    async fn create_a_record(&self, name: &str, target: &str) -> anyhow::Result<String>;
    async fn delete_a_record(&self, record_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Route `domain` to `upstream`; returns the route id.
    async fn create_route(&self, domain: &str, upstream: &str) -> anyhow::Result<String>;
    async fn delete_route(&self, route_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DatabaseManager: Send + Sync {
    /// Create a database and a login role of the same name.
    async fn create_database(&self, name: &str, password: &str) -> anyhow::Result<()>;
    async fn drop_database(&self, name: &str) -> anyhow::Result<()>;
    async fn verify_database_exists(&self, name: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create a bucket readable and writable with the given key pair.
    async fn create_bucket(
        &self,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> anyhow::Result<()>;
    /// Delete a bucket and its contents. Deleting a missing bucket succeeds.
    async fn delete_bucket(&self, bucket: &str) -> anyhow::Result<()>;
}

/// Tells a running tenant it is about to go away.
///
/// Best-effort: implementations swallow and log their own failures.
#[async_trait]
pub trait InstanceNotifier: Send + Sync {
    async fn notify_shutting_down(&self, domain: &str, reason: &str);
}

/// The full set of collaborators, shared by every step.
#[derive(Clone)]
pub struct Clients {
    pub containers: Arc<dyn ContainerRuntime>,
    pub dns: Arc<dyn DnsProvider>,
    pub proxy: Arc<dyn ProxyManager>,
    pub databases: Arc<dyn DatabaseManager>,
    pub storage: Arc<dyn ObjectStorage>,
    pub notifier: Arc<dyn InstanceNotifier>,
}
