//! Domain types for the hostgrid instance store.
//!
//! All records are JSON-serialized into redb value columns. Relationships
//! are plain id fields; [`InstanceAggregate`] is the explicit loader for
//! an instance together with its owned records.

use serde::{Deserialize, Serialize};

/// Snowflake id of an instance.
pub type InstanceId = hostgrid_core::SnowflakeId;

/// Snowflake worker id handed to a tenant instance (0..=1023).
pub type WorkerId = u16;

// ── Instance ──────────────────────────────────────────────────────

/// One tenant's isolated deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub owner_id: String,
    /// Fully-qualified domain, unique among non-destroyed instances.
    pub domain: String,
    /// The tenant-chosen label the domain was built from.
    pub subdomain: String,
    pub display_name: String,
    /// Quota tier the instance counts against.
    pub tier: String,
    pub status: InstanceStatus,
    pub worker_id: Option<WorkerId>,
    /// Row token for optimistic concurrency on status writes.
    pub version: u64,
    /// Unix timestamp (seconds).
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Running,
    Suspended,
    Failed,
    Destroyed,
}

impl InstanceStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Statuses only move forward, except Running and Suspended which
    /// toggle. Any live status may be destroyed.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Pending, Provisioning) => true,
            (Provisioning, Running | Failed) => true,
            (Running, Suspended) | (Suspended, Running) => true,
            _ => false,
        }
    }

    pub fn is_live(self) -> bool {
        self != InstanceStatus::Destroyed
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

// ── Infrastructure ────────────────────────────────────────────────

/// Resource handles and encrypted secrets owned by one instance.
///
/// Filled in field by field as provisioning steps succeed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceInfrastructure {
    pub instance_id: InstanceId,
    pub container_id: Option<String>,
    pub network_id: Option<String>,
    pub database_name: Option<String>,
    /// Database password encrypted under the instance DEK.
    pub database_password_enc: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_access_key: Option<String>,
    /// Storage secret key encrypted under the instance DEK.
    pub storage_secret_key_enc: Option<String>,
    pub proxy_route_id: Option<String>,
    pub dns_record_id: Option<String>,
    /// Hex SHA-256 of the bootstrap token; the token itself is never stored.
    pub bootstrap_token_hash: Option<String>,
    /// Instance DEK wrapped by the KEK, base64.
    pub wrapped_dek: Option<String>,
    /// Set by the reconciler when no live instance owns this row.
    pub orphaned_at: Option<u64>,
    pub updated_at: u64,
}

impl InstanceInfrastructure {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            ..Self::default()
        }
    }

    /// Whether any external resource handle is still recorded.
    pub fn holds_resources(&self) -> bool {
        self.container_id.is_some()
            || self.network_id.is_some()
            || self.database_name.is_some()
            || self.storage_bucket.is_some()
            || self.proxy_route_id.is_some()
            || self.dns_record_id.is_some()
    }

    /// Whether any secret material is still recorded.
    pub fn holds_secrets(&self) -> bool {
        self.wrapped_dek.is_some()
            || self.database_password_enc.is_some()
            || self.storage_secret_key_enc.is_some()
            || self.bootstrap_token_hash.is_some()
    }
}

// ── Worker id registry ────────────────────────────────────────────

/// One slot of the fixed worker-id space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerIdEntry {
    pub worker_id: WorkerId,
    pub assigned_instance_id: Option<InstanceId>,
    /// Once set, the slot is never handed out again.
    pub is_tombstoned: bool,
    pub allocated_at: Option<u64>,
    pub released_at: Option<u64>,
}

impl WorkerIdEntry {
    pub fn free(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            assigned_instance_id: None,
            is_tombstoned: false,
            allocated_at: None,
            released_at: None,
        }
    }

    pub fn is_available(&self) -> bool {
        !self.is_tombstoned && self.assigned_instance_id.is_none()
    }
}

// ── Provisioning events ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Provision,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Succeeded,
    Failed,
}

/// Append-only audit row for one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningEvent {
    pub instance_id: InstanceId,
    pub phase: EventPhase,
    pub step_name: String,
    pub status: EventStatus,
    pub error_message: Option<String>,
    /// Unix timestamp (milliseconds).
    pub created_at_ms: u64,
}

// ── Health ────────────────────────────────────────────────────────

/// Latest health observation for an instance. Written only by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_at: u64,
    /// `None` when the endpoint could not be reached at all.
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Outcome of one probe, as handed to [`crate::StateStore::record_probe`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeObservation {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

// ── Aggregate ─────────────────────────────────────────────────────

/// An instance with its owned records, read in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceAggregate {
    pub instance: Instance,
    pub infrastructure: Option<InstanceInfrastructure>,
    pub health: Option<HealthRecord>,
}

/// Result of trying to claim a Pending instance for provisioning.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionClaim {
    /// The instance moved Pending → Provisioning and belongs to the caller.
    Claimed(Instance),
    /// The instance is not Pending; nothing was changed.
    NotEligible(InstanceStatus),
}

impl Instance {
    /// Build the key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(self.id)
    }
}

/// Zero-padded so lexical order matches numeric order.
pub fn instance_key(id: InstanceId) -> String {
    format!("{id:020}")
}

/// Events sort by instance, then by insertion sequence.
pub fn event_key(instance_id: InstanceId, seq: u64) -> String {
    format!("{}:{seq:020}", instance_key(instance_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        for s in [Pending, Provisioning, Running, Suspended, Failed] {
            assert!(s.can_transition_to(Destroyed));
        }
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(!Running.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Destroyed.can_transition_to(Running));
        assert!(!Destroyed.can_transition_to(Destroyed));
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(instance_key(9) < instance_key(10));
        assert!(event_key(5, 2) < event_key(5, 10));
        assert!(event_key(5, 99) < event_key(6, 0));
    }
}
