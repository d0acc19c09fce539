#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hostgrid_core::{HostgridConfig, SnowflakeGenerator};
use hostgrid_crypto::SecretKey;
use hostgrid_provision::{CreateInstance, MemoryQueue, Orchestrator, SimulatedBackend, StepContext};
use hostgrid_state::{EventStatus, Instance, InstanceId, StateStore};
use tokio_util::sync::CancellationToken;

pub const BASE_DOMAIN: &str = "tenants.test";

pub struct Harness {
    pub store: StateStore,
    pub sim: Arc<SimulatedBackend>,
    pub queue: Arc<MemoryQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub kek: SecretKey,
}

pub fn test_config() -> HostgridConfig {
    let mut config = HostgridConfig::development();
    config.provisioning.base_domain = BASE_DOMAIN.to_string();
    config.provisioning.call_timeout = "2s".to_string();
    config.provisioning.suspend_grace = "50ms".to_string();
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: HostgridConfig) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let sim = SimulatedBackend::new();
    let kek = SecretKey::generate();
    let queue = Arc::new(MemoryQueue::new());
    let ctx = Arc::new(StepContext::new(
        store.clone(),
        sim.clients(),
        Arc::new(config),
        kek.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        ctx,
        SnowflakeGenerator::new(1).unwrap(),
        queue.clone(),
    ));
    Harness {
        store,
        sim,
        queue,
        orchestrator,
        kek,
    }
}

pub fn request(owner: &str, subdomain: &str, tier: &str) -> CreateInstance {
    CreateInstance {
        owner_id: owner.to_string(),
        subdomain: subdomain.to_string(),
        display_name: format!("{subdomain} site"),
        tier: tier.to_string(),
    }
}

impl Harness {
    /// Create and provision an instance, expecting it to come up.
    pub async fn running(&self, subdomain: &str) -> Instance {
        let created = self
            .orchestrator
            .create(request("owner-1", subdomain, "pro"))
            .await
            .unwrap();
        self.orchestrator
            .provision(created.id, &CancellationToken::new())
            .await
            .unwrap();
        self.store.get_instance(created.id).unwrap().unwrap()
    }

    /// Step names with a Failed event, in order.
    pub fn failed_steps(&self, id: InstanceId) -> Vec<String> {
        self.steps_with(id, EventStatus::Failed)
    }

    pub fn steps_with(&self, id: InstanceId, status: EventStatus) -> Vec<String> {
        self.store
            .list_events(id)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == status)
            .map(|e| e.step_name)
            .collect()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
