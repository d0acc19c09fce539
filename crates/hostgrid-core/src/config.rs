//! hostgrid.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::snowflake::MAX_WORKER_ID;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostgridConfig {
    pub control_plane: ControlPlaneConfig,
    pub kek: KekConfig,
    /// Per-tier quotas, keyed by tier name.
    pub tiers: BTreeMap<String, TierQuota>,
    pub provisioning: ProvisioningConfig,
    pub health: HealthConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Worker id of the control plane's own Snowflake generator.
    pub worker_id: u32,
    pub data_dir: PathBuf,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            data_dir: PathBuf::from("/var/lib/hostgrid"),
        }
    }
}

/// Where the key-encryption key comes from. Exactly one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KekConfig {
    /// File holding the base64-encoded 32-byte KEK.
    pub path: Option<PathBuf>,
    /// Inline base64-encoded 32-byte KEK.
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierQuota {
    /// Live (non-destroyed) instances one owner may hold on this tier.
    pub max_instances: u32,
}

/// What the queue consumer does with an instance whose provisioning failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the instance Failed for an operator to inspect.
    #[default]
    Leave,
    /// Run the destruction pipeline right away.
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub base_domain: String,
    /// Image started for every tenant.
    pub app_image: String,
    /// Port the tenant application listens on inside its network.
    pub app_port: u16,
    /// Address tenant A records point at (the reverse proxy).
    pub ingress_address: String,
    /// Upper bound on any single external call.
    pub call_timeout: String,
    /// Delay between the shutdown notice and stopping a suspended container.
    pub suspend_grace: String,
    pub on_failure: FailurePolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            base_domain: "hostgrid.local".to_string(),
            app_image: "hostgrid/tenant-app:latest".to_string(),
            app_port: 8080,
            ingress_address: "127.0.0.1".to_string(),
            call_timeout: "30s".to_string(),
            suspend_grace: "5s".to_string(),
            on_failure: FailurePolicy::Leave,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    /// Timeout per probe.
    pub timeout: String,
    /// Probe URL; `{domain}` is replaced with the instance domain.
    pub url_template: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            timeout: "5s".to_string(),
            url_template: "http://{domain}/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval: String,
    /// Consecutive probe failures tolerated before escalation.
    pub failure_threshold: u32,
    /// Suspend instances that cross the threshold instead of only alerting.
    pub suspend_unhealthy: bool,
    /// Upper bound on suspensions waiting out their grace period at once.
    pub max_concurrent_suspends: usize,
    /// A Provisioning instance with no pipeline activity for this long is
    /// presumed abandoned and marked Failed.
    pub stall_after: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            failure_threshold: 3,
            suspend_unhealthy: false,
            max_concurrent_suspends: 8,
            stall_after: "15m".to_string(),
        }
    }
}

impl ProvisioningConfig {
    pub fn call_timeout(&self) -> Duration {
        parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn suspend_grace(&self) -> Duration {
        parse_duration(&self.suspend_grace).unwrap_or(Duration::from_secs(5))
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Probe URL for one instance.
    pub fn url_for(&self, domain: &str) -> String {
        self.url_template.replace("{domain}", domain)
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn stall_after(&self) -> Duration {
        parse_duration(&self.stall_after).unwrap_or(Duration::from_secs(15 * 60))
    }
}

impl HostgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HostgridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Quota for a tier, if the tier exists.
    pub fn tier(&self, name: &str) -> Option<&TierQuota> {
        self.tiers.get(name)
    }

    /// Reject configurations the control plane cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.control_plane.worker_id > MAX_WORKER_ID as u32 {
            bail!(
                "control_plane.worker_id {} out of range (0..={MAX_WORKER_ID})",
                self.control_plane.worker_id
            );
        }
        if self.kek.path.is_some() && self.kek.value.is_some() {
            bail!("kek.path and kek.value are mutually exclusive");
        }
        if self.tiers.is_empty() {
            bail!("at least one [tiers.<name>] table is required");
        }
        for (label, value) in [
            ("provisioning.call_timeout", &self.provisioning.call_timeout),
            ("provisioning.suspend_grace", &self.provisioning.suspend_grace),
            ("health.interval", &self.health.interval),
            ("health.timeout", &self.health.timeout),
            ("reconciler.interval", &self.reconciler.interval),
            ("reconciler.stall_after", &self.reconciler.stall_after),
        ] {
            if parse_duration(value).is_none() {
                bail!("{label}: invalid duration '{value}'");
            }
        }
        if self.reconciler.max_concurrent_suspends == 0 {
            bail!("reconciler.max_concurrent_suspends must be at least 1");
        }
        Ok(())
    }

    /// A development configuration with the stock tier table.
    pub fn development() -> Self {
        Self {
            tiers: BTreeMap::from([
                ("free".to_string(), TierQuota { max_instances: 1 }),
                ("pro".to_string(), TierQuota { max_instances: 5 }),
                ("enterprise".to_string(), TierQuota { max_instances: 50 }),
            ]),
            ..Self::default()
        }
    }
}
