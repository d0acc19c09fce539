//! In-process infrastructure backends.
//!
//! [`SimulatedBackend`] implements every client trait against in-memory
//! maps. Any operation can be made to fail or to stall, and every call is
//! logged, which is what the pipeline tests and `hostd run --simulate`
//! rely on. Removal operations treat missing resources as already gone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::*;

/// Operation names accepted by [`SimulatedBackend::fail`] and
/// [`SimulatedBackend::delay`].
pub mod ops {
    pub const CREATE_NETWORK: &str = "create_network";
    pub const START_CONTAINER: &str = "start_container";
    pub const STOP_CONTAINER: &str = "stop_container";
    pub const REMOVE_CONTAINER: &str = "remove_container";
    pub const REMOVE_NETWORK: &str = "remove_network";
    pub const VERIFY_CONTAINER_RUNNING: &str = "verify_container_running";
    pub const CREATE_A_RECORD: &str = "create_a_record";
    pub const DELETE_A_RECORD: &str = "delete_a_record";
    pub const CREATE_ROUTE: &str = "create_route";
    pub const DELETE_ROUTE: &str = "delete_route";
    pub const CREATE_DATABASE: &str = "create_database";
    pub const DROP_DATABASE: &str = "drop_database";
    pub const VERIFY_DATABASE_EXISTS: &str = "verify_database_exists";
    pub const CREATE_BUCKET: &str = "create_bucket";
    pub const DELETE_BUCKET: &str = "delete_bucket";
    pub const NOTIFY_SHUTTING_DOWN: &str = "notify_shutting_down";
}

#[derive(Debug, Clone)]
struct SimContainer {
    name: String,
    running: bool,
    env: BTreeMap<String, String>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    networks: BTreeSet<String>,
    containers: BTreeMap<String, SimContainer>,
    /// record id → name
    dns_records: BTreeMap<String, String>,
    /// route id → (domain, upstream)
    routes: BTreeMap<String, (String, String)>,
    databases: BTreeSet<String>,
    buckets: BTreeSet<String>,
    notices: Vec<(String, String)>,
    faults: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

impl SimState {
    fn handle(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{prefix}-{}", self.next_handle)
    }
}

/// Simulated container runtime, DNS, proxy, database, storage and notifier.
#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A [`Clients`] bundle where every collaborator is this backend.
    pub fn clients(self: &Arc<Self>) -> Clients {
        Clients {
            containers: self.clone(),
            dns: self.clone(),
            proxy: self.clone(),
            databases: self.clone(),
            storage: self.clone(),
            notifier: self.clone(),
        }
    }

    /// Make every future call of `op` fail until [`heal`](Self::heal).
    pub fn fail(&self, op: &str) {
        self.state.lock().unwrap().faults.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().unwrap().faults.remove(op);
    }

    /// Make every future call of `op` take at least `by`.
    pub fn delay(&self, op: &str, by: Duration) {
        self.state.lock().unwrap().delays.insert(op.to_string(), by);
    }

    /// Every operation invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }

    pub fn has_network(&self, network_id: &str) -> bool {
        self.state.lock().unwrap().networks.contains(network_id)
    }

    pub fn has_container(&self, container_id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(container_id)
    }

    pub fn container_running(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
    }

    /// Environment a container was started with.
    pub fn container_env(&self, container_id: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.env.clone())
    }

    pub fn has_dns_record(&self, record_id: &str) -> bool {
        self.state.lock().unwrap().dns_records.contains_key(record_id)
    }

    pub fn has_route(&self, route_id: &str) -> bool {
        self.state.lock().unwrap().routes.contains_key(route_id)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.lock().unwrap().buckets.contains(bucket)
    }

    /// Shutdown notices delivered so far, as `(domain, reason)`.
    pub fn notices(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().notices.clone()
    }

    /// Whether `domain` is routed to a running container.
    pub fn serves(&self, domain: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.routes.values().any(|(routed, upstream)| {
            let host = upstream
                .trim_start_matches("http://")
                .split([':', '/'])
                .next()
                .unwrap_or_default();
            routed == domain
                && state
                    .containers
                    .values()
                    .any(|c| c.running && c.name == host)
        })
    }

    /// Stop a container behind the orchestrator's back.
    pub fn crash_container(&self, container_id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.running = false;
        }
    }

    /// Drop a database behind the orchestrator's back.
    pub fn lose_database(&self, name: &str) {
        self.state.lock().unwrap().databases.remove(name);
    }

    /// Log the call, then apply any configured delay and fault.
    async fn enter(&self, op: &'static str) -> anyhow::Result<()> {
        let (delay, faulted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(op.to_string());
            (state.delays.get(op).copied(), state.faults.contains(op))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if faulted {
            bail!("injected fault in {op}");
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedBackend {
    async fn create_network(&self, name: &str) -> anyhow::Result<String> {
        self.enter(ops::CREATE_NETWORK).await?;
        let mut state = self.state.lock().unwrap();
        let id = state.handle("net");
        state.networks.insert(id.clone());
        debug!(%name, network_id = %id, "sim: network created");
        Ok(id)
    }

    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.enter(ops::START_CONTAINER).await?;
        let mut state = self.state.lock().unwrap();
        if !state.networks.contains(&spec.network_id) {
            bail!("network {} does not exist", spec.network_id);
        }
        let id = state.handle("ctr");
        state.containers.insert(
            id.clone(),
            SimContainer {
                name: spec.name.clone(),
                running: true,
                env: spec.env.clone(),
            },
        );
        debug!(name = %spec.name, container_id = %id, "sim: container started");
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.enter(ops::STOP_CONTAINER).await?;
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.enter(ops::REMOVE_CONTAINER).await?;
        self.state.lock().unwrap().containers.remove(container_id);
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> anyhow::Result<()> {
        self.enter(ops::REMOVE_NETWORK).await?;
        self.state.lock().unwrap().networks.remove(network_id);
        Ok(())
    }

    async fn verify_container_running(&self, container_id: &str) -> anyhow::Result<bool> {
        self.enter(ops::VERIFY_CONTAINER_RUNNING).await?;
        Ok(self.container_running(container_id))
    }
}

#[async_trait]
impl DnsProvider for SimulatedBackend {
    async fn create_a_record(&self, name: &str, target: &str) -> anyhow::Result<String> {
        self.enter(ops::CREATE_A_RECORD).await?;
        let mut state = self.state.lock().unwrap();
        let id = state.handle("dns");
        state.dns_records.insert(id.clone(), name.to_string());
        debug!(%name, %target, record_id = %id, "sim: A record created");
        Ok(id)
    }

    async fn delete_a_record(&self, record_id: &str) -> anyhow::Result<()> {
        self.enter(ops::DELETE_A_RECORD).await?;
        self.state.lock().unwrap().dns_records.remove(record_id);
        Ok(())
    }
}

#[async_trait]
impl ProxyManager for SimulatedBackend {
    async fn create_route(&self, domain: &str, upstream: &str) -> anyhow::Result<String> {
        self.enter(ops::CREATE_ROUTE).await?;
        let mut state = self.state.lock().unwrap();
        let id = state.handle("route");
        state
            .routes
            .insert(id.clone(), (domain.to_string(), upstream.to_string()));
        Ok(id)
    }

    async fn delete_route(&self, route_id: &str) -> anyhow::Result<()> {
        self.enter(ops::DELETE_ROUTE).await?;
        self.state.lock().unwrap().routes.remove(route_id);
        Ok(())
    }
}

#[async_trait]
impl DatabaseManager for SimulatedBackend {
    async fn create_database(&self, name: &str, password: &str) -> anyhow::Result<()> {
        self.enter(ops::CREATE_DATABASE).await?;
        if password.is_empty() {
            bail!("empty password for role {name}");
        }
        if !self.state.lock().unwrap().databases.insert(name.to_string()) {
            bail!("database {name} already exists");
        }
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> anyhow::Result<()> {
        self.enter(ops::DROP_DATABASE).await?;
        self.state.lock().unwrap().databases.remove(name);
        Ok(())
    }

    async fn verify_database_exists(&self, name: &str) -> anyhow::Result<bool> {
        self.enter(ops::VERIFY_DATABASE_EXISTS).await?;
        Ok(self.has_database(name))
    }
}

#[async_trait]
impl ObjectStorage for SimulatedBackend {
    async fn create_bucket(
        &self,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> anyhow::Result<()> {
        self.enter(ops::CREATE_BUCKET).await?;
        if access_key.is_empty() || secret_key.is_empty() {
            bail!("bucket {bucket} needs a key pair");
        }
        if !self.state.lock().unwrap().buckets.insert(bucket.to_string()) {
            bail!("bucket {bucket} already exists");
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> anyhow::Result<()> {
        self.enter(ops::DELETE_BUCKET).await?;
        self.state.lock().unwrap().buckets.remove(bucket);
        Ok(())
    }
}

#[async_trait]
impl InstanceNotifier for SimulatedBackend {
    async fn notify_shutting_down(&self, domain: &str, reason: &str) {
        let delivered = self
            .enter(ops::NOTIFY_SHUTTING_DOWN)
            .await
            .context("shutdown notice not delivered");
        match delivered {
            Ok(()) => self
                .state
                .lock()
                .unwrap()
                .notices
                .push((domain.to_string(), reason.to_string())),
            Err(e) => warn!(%domain, error = %format!("{e:#}"), "sim: shutdown notice failed"),
        }
    }
}
