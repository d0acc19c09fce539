//! Control plane: builds every component at one composition point and
//! runs the background loops.
//!
//! In this mode, the daemon:
//! 1. Opens the instance store
//! 2. Loads the KEK
//! 3. Builds the orchestrator over the infrastructure clients
//! 4. Re-enqueues Pending instances left over from the last run
//! 5. Runs the queue consumer, health monitor and reconciler until Ctrl-C

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use hostgrid_core::{HostgridConfig, SnowflakeGenerator};
use hostgrid_crypto::{load_kek, SecretKey};
use hostgrid_health::{HealthMonitor, HealthVerifier, HttpVerifier, Reconciler};
use hostgrid_provision::{
    Clients, CreateInstance, MemoryQueue, Orchestrator, QueueConsumer, SimulatedBackend,
    StepContext,
};
use hostgrid_state::{ProbeObservation, StateStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct RunOptions {
    pub simulate: bool,
    /// Probe instance URLs over HTTP even with simulated backends.
    pub http_probes: bool,
    pub demo: u32,
}

/// Everything the background loops need, wired together.
pub struct ControlPlane {
    pub orchestrator: Arc<Orchestrator>,
    pub consumer: Arc<QueueConsumer>,
    pub monitor: Arc<HealthMonitor>,
    pub reconciler: Arc<Reconciler>,
}

impl ControlPlane {
    pub fn build(config: HostgridConfig, options: &RunOptions) -> anyhow::Result<Self> {
        config.validate()?;

        let data_dir = &config.control_plane.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let db_path = data_dir.join("hostgrid.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "instance store opened");

        let kek = match load_kek(&config.kek)? {
            Some(kek) => kek,
            None if options.simulate => {
                warn!("no KEK configured, using an ephemeral one; stored secrets will not survive a restart");
                SecretKey::generate()
            }
            None => bail!("no KEK configured: set [kek] path or value"),
        };

        if !options.simulate {
            bail!("no infrastructure backends configured; run with --simulate");
        }
        let sim = SimulatedBackend::new();
        info!("using simulated infrastructure backends");
        let verifier: Arc<dyn HealthVerifier> = if options.http_probes {
            Arc::new(HttpVerifier::new(config.health.timeout()))
        } else {
            Arc::new(SimulatedVerifier { sim: sim.clone() })
        };
        Self::assemble(config, store, sim.clients(), verifier, kek)
    }

    /// Wire the components over explicit collaborators.
    pub fn assemble(
        config: HostgridConfig,
        store: StateStore,
        clients: Clients,
        verifier: Arc<dyn HealthVerifier>,
        kek: SecretKey,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let ids = SnowflakeGenerator::new(config.control_plane.worker_id)?;
        let ctx = Arc::new(StepContext::new(store.clone(), clients, config.clone(), kek));
        let orchestrator = Arc::new(Orchestrator::new(ctx, ids, Arc::new(MemoryQueue::new())));

        Ok(Self {
            consumer: Arc::new(QueueConsumer::new(orchestrator.clone())),
            monitor: Arc::new(HealthMonitor::new(
                store,
                verifier,
                config.health.clone(),
            )),
            reconciler: Arc::new(Reconciler::new(orchestrator.clone())),
            orchestrator,
        })
    }

    /// Create `count` demo instances on the first configured tier.
    pub async fn seed_demo(&self, count: u32) -> usize {
        let Some(tier) = self.orchestrator.config().tiers.keys().next().cloned() else {
            return 0;
        };
        let mut created = 0;
        for n in 1..=count {
            let request = CreateInstance {
                owner_id: format!("demo-owner-{n}"),
                subdomain: format!("demo-{n}"),
                display_name: format!("Demo {n}"),
                tier: tier.clone(),
            };
            match self.orchestrator.create(request).await {
                Ok(instance) => {
                    info!(instance_id = instance.id, domain = %instance.domain, "demo instance created");
                    created += 1;
                }
                Err(e) => warn!(n, error = %e, "demo instance not created"),
            }
        }
        created
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run(config: HostgridConfig, options: RunOptions) -> anyhow::Result<()> {
    info!("hostgrid control plane starting");
    let plane = ControlPlane::build(config, &options)?;

    let recovered = plane.consumer.recover().await?;
    info!(recovered, "provisioning queue recovered");
    if options.demo > 0 {
        plane.seed_demo(options.demo).await;
    }

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_handle = tokio::spawn(plane.consumer.clone().run(shutdown_rx.clone()));
    let monitor = plane.monitor.clone();
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });
    let reconciler = plane.reconciler.clone();
    let reconciler_shutdown = shutdown_rx;
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(reconciler_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [
        ("queue consumer", consumer_handle),
        ("health monitor", monitor_handle),
        ("reconciler", reconciler_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background task panicked");
        }
    }

    info!("control plane stopped");
    Ok(())
}

/// Health verifier for simulated deployments: an instance is healthy when
/// its route leads to a running container.
struct SimulatedVerifier {
    sim: Arc<SimulatedBackend>,
}

#[async_trait]
impl HealthVerifier for SimulatedVerifier {
    async fn probe(&self, url: &str) -> ProbeObservation {
        let host = url
            .parse::<http::Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string));
        match host {
            Some(host) if self.sim.serves(&host) => ProbeObservation {
                healthy: true,
                latency_ms: Some(1),
                error: None,
            },
            Some(host) => ProbeObservation {
                healthy: false,
                latency_ms: None,
                error: Some(format!("no running upstream for {host}")),
            },
            None => ProbeObservation {
                healthy: false,
                latency_ms: None,
                error: Some(format!("invalid probe url '{url}'")),
            },
        }
    }
}
