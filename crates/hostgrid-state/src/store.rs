//! StateStore — redb-backed persistence for the instance lifecycle.
//!
//! Provides typed operations over instances, infrastructure records, the
//! worker-id registry, health records and provisioning events. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hostgrid_core::WORKER_ID_SPACE;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// Free / assigned / tombstoned counts across the worker-id registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerIdUsage {
    pub free: u32,
    pub assigned: u32,
    pub tombstoned: u32,
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: Option<&str>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if prefix.is_some_and(|p| !key.value().starts_with(p)) {
            continue;
        }
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn write_json<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn read_worker_entry(
    table: &impl ReadableTable<u16, &'static [u8]>,
    worker_id: WorkerId,
) -> StateResult<WorkerIdEntry> {
    match table.get(worker_id).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
        None => Err(StateError::UnknownWorkerId(worker_id)),
    }
}

fn write_worker_entry(
    table: &mut redb::Table<'_, u16, &'static [u8]>,
    entry: &WorkerIdEntry,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
    table
        .insert(entry.worker_id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn require_instance(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: InstanceId,
) -> StateResult<Instance> {
    read_json(table, &instance_key(id))?
        .ok_or_else(|| StateError::NotFound(format!("instance {id}")))
}

fn check_version(instance: &Instance, expected: u64) -> StateResult<()> {
    if instance.version != expected {
        return Err(StateError::VersionConflict {
            instance_id: instance.id,
            expected,
            actual: instance.version,
        });
    }
    Ok(())
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet and seed the worker-id space.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        txn.open_table(INFRASTRUCTURE).map_err(map_err!(Table))?;
        txn.open_table(HEALTH).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let mut seeded = 0u32;
        {
            let mut workers = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;
            for worker_id in 0..WORKER_ID_SPACE {
                if workers.get(worker_id).map_err(map_err!(Read))?.is_none() {
                    write_worker_entry(&mut workers, &WorkerIdEntry::free(worker_id))?;
                    seeded += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if seeded > 0 {
            info!(seeded, "worker id registry seeded");
        }
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance, claiming its domain in the same transaction.
    ///
    /// Fails with [`StateError::DomainTaken`] if a non-destroyed instance
    /// already holds the domain.
    pub fn insert_instance(&self, instance: &Instance) -> StateResult<()> {
        let key = instance.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut domains = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            if domains
                .get(instance.domain.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::DomainTaken(instance.domain.clone()));
            }
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            if read_json::<Instance>(&instances, &key)?.is_some() {
                return Err(StateError::AlreadyExists(instance.id));
            }
            write_json(&mut instances, &key, instance)?;
            domains
                .insert(instance.domain.as_str(), instance.id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = instance.id, domain = %instance.domain, "instance stored");
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: InstanceId) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        read_json(&table, &instance_key(id))
    }

    /// List all instances, oldest id first.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        scan_json(&table, None)
    }

    /// List instances currently in `status`.
    pub fn list_instances_with_status(&self, status: InstanceStatus) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.status == status)
            .collect())
    }

    /// Count an owner's non-destroyed instances on a tier.
    pub fn count_live_instances(&self, owner_id: &str, tier: &str) -> StateResult<u32> {
        let count = self
            .list_instances()?
            .iter()
            .filter(|i| i.owner_id == owner_id && i.tier == tier && i.status.is_live())
            .count();
        Ok(count as u32)
    }

    /// Count an owner's non-destroyed instances on a tier that were
    /// created before `id`. Quota checks use this so that, of several
    /// instances racing for the last slot, the oldest one wins.
    pub fn count_live_instances_before(
        &self,
        owner_id: &str,
        tier: &str,
        id: InstanceId,
    ) -> StateResult<u32> {
        let count = self
            .list_instances()?
            .iter()
            .filter(|i| {
                i.id < id && i.owner_id == owner_id && i.tier == tier && i.status.is_live()
            })
            .count();
        Ok(count as u32)
    }

    /// The non-destroyed instance holding `domain`, if any.
    pub fn domain_owner(&self, domain: &str) -> StateResult<Option<InstanceId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        Ok(table
            .get(domain)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value()))
    }

    /// Atomically move a Pending instance to Provisioning.
    ///
    /// Only one caller can win the claim; everyone else sees
    /// [`ProvisionClaim::NotEligible`] with the current status.
    pub fn claim_for_provisioning(&self, id: InstanceId) -> StateResult<ProvisionClaim> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claim = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance = require_instance(&table, id)?;
            if instance.status != InstanceStatus::Pending {
                ProvisionClaim::NotEligible(instance.status)
            } else {
                instance.status = InstanceStatus::Provisioning;
                instance.version += 1;
                write_json(&mut table, &instance.table_key(), &instance)?;
                ProvisionClaim::Claimed(instance)
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claim)
    }

    /// Version-checked status write.
    ///
    /// Fails with [`StateError::VersionConflict`] if the instance changed
    /// since `expected_version` was read, and with
    /// [`StateError::InvalidTransition`] for illegal moves. Destruction goes
    /// through [`StateStore::finalize_destruction`] instead.
    pub fn transition_status(
        &self,
        id: InstanceId,
        expected_version: u64,
        next: InstanceStatus,
    ) -> StateResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance = require_instance(&table, id)?;
            check_version(&instance, expected_version)?;
            if next == InstanceStatus::Destroyed || !instance.status.can_transition_to(next) {
                return Err(StateError::InvalidTransition {
                    from: instance.status,
                    to: next,
                });
            }
            instance.status = next;
            instance.version += 1;
            write_json(&mut table, &instance.table_key(), &instance)?;
            instance
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = id, status = %next, "instance status updated");
        Ok(instance)
    }

    /// Final write of the destroy path, in one transaction: tombstone the
    /// instance's worker id, mark it Destroyed, release its domain.
    pub fn finalize_destruction(
        &self,
        id: InstanceId,
        expected_version: u64,
    ) -> StateResult<Instance> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance = require_instance(&table, id)?;
            check_version(&instance, expected_version)?;
            if !instance.status.can_transition_to(InstanceStatus::Destroyed) {
                return Err(StateError::InvalidTransition {
                    from: instance.status,
                    to: InstanceStatus::Destroyed,
                });
            }

            if let Some(worker_id) = instance.worker_id {
                let mut workers = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;
                let mut entry = read_worker_entry(&workers, worker_id)?;
                entry.is_tombstoned = true;
                entry.assigned_instance_id = None;
                entry.released_at = Some(now);
                write_worker_entry(&mut workers, &entry)?;
            }

            let mut domains = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
            let holder = domains
                .get(instance.domain.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            if holder == Some(id) {
                domains
                    .remove(instance.domain.as_str())
                    .map_err(map_err!(Write))?;
            }

            instance.status = InstanceStatus::Destroyed;
            instance.deleted_at = Some(now);
            instance.version += 1;
            write_json(&mut table, &instance.table_key(), &instance)?;
            instance
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(instance_id = id, worker_id = ?instance.worker_id, "instance destroyed");
        Ok(instance)
    }

    /// Load an instance with its infrastructure and health in one read.
    pub fn load_aggregate(&self, id: InstanceId) -> StateResult<Option<InstanceAggregate>> {
        let key = instance_key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let Some(instance) = read_json::<Instance>(&instances, &key)? else {
            return Ok(None);
        };
        let infra = txn.open_table(INFRASTRUCTURE).map_err(map_err!(Table))?;
        let health = txn.open_table(HEALTH).map_err(map_err!(Table))?;
        Ok(Some(InstanceAggregate {
            instance,
            infrastructure: read_json(&infra, &key)?,
            health: read_json(&health, &key)?,
        }))
    }

    // ── Infrastructure ─────────────────────────────────────────────

    /// Get the infrastructure record for an instance.
    pub fn get_infrastructure(&self, id: InstanceId) -> StateResult<Option<InstanceInfrastructure>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INFRASTRUCTURE).map_err(map_err!(Table))?;
        read_json(&table, &instance_key(id))
    }

    /// List every infrastructure record.
    pub fn list_infrastructure(&self) -> StateResult<Vec<InstanceInfrastructure>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INFRASTRUCTURE).map_err(map_err!(Table))?;
        scan_json(&table, None)
    }

    /// Read-modify-write of one infrastructure record.
    ///
    /// Creates the record on first use. `apply` should touch only the
    /// fields its caller owns; the record is never replaced wholesale.
    pub fn update_infrastructure<F>(&self, id: InstanceId, apply: F) -> StateResult<InstanceInfrastructure>
    where
        F: FnOnce(&mut InstanceInfrastructure),
    {
        let key = instance_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(INFRASTRUCTURE).map_err(map_err!(Table))?;
            let mut record = read_json::<InstanceInfrastructure>(&table, &key)?
                .unwrap_or_else(|| InstanceInfrastructure::new(id));
            apply(&mut record);
            record.updated_at = epoch_secs();
            write_json(&mut table, &key, &record)?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    // ── Worker ids ─────────────────────────────────────────────────

    /// Claim the lowest-numbered worker id that is neither assigned nor
    /// tombstoned and record it on the instance.
    ///
    /// Idempotent per instance: if the instance already owns a live entry,
    /// that id is returned. Fails with [`StateError::WorkerIdsExhausted`]
    /// when every slot is taken or tombstoned.
    pub fn allocate_worker_id(&self, instance_id: InstanceId) -> StateResult<WorkerId> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let worker_id = {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance = require_instance(&instances, instance_id)?;
            let mut workers = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;

            let mut existing = None;
            let mut lowest_free = None;
            for entry in workers.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let entry: WorkerIdEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !entry.is_tombstoned && entry.assigned_instance_id == Some(instance_id) {
                    existing = Some(entry.worker_id);
                    break;
                }
                if lowest_free.is_none() && entry.is_available() {
                    lowest_free = Some(entry);
                }
            }

            match (existing, lowest_free) {
                (Some(worker_id), _) => worker_id,
                (None, Some(mut entry)) => {
                    entry.assigned_instance_id = Some(instance_id);
                    entry.allocated_at = Some(now);
                    write_worker_entry(&mut workers, &entry)?;
                    instance.worker_id = Some(entry.worker_id);
                    write_json(&mut instances, &instance.table_key(), &instance)?;
                    entry.worker_id
                }
                (None, None) => return Err(StateError::WorkerIdsExhausted),
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id, worker_id, "worker id allocated");
        Ok(worker_id)
    }

    /// Permanently retire a worker id. Tombstoning twice is a no-op.
    pub fn tombstone_worker_id(&self, worker_id: WorkerId) -> StateResult<WorkerIdEntry> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry = {
            let mut workers = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;
            let mut entry = read_worker_entry(&workers, worker_id)?;
            if !entry.is_tombstoned {
                entry.is_tombstoned = true;
                entry.assigned_instance_id = None;
                entry.released_at = Some(epoch_secs());
                write_worker_entry(&mut workers, &entry)?;
            }
            entry
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_id, "worker id tombstoned");
        Ok(entry)
    }

    /// Get one registry entry.
    pub fn get_worker_id(&self, worker_id: WorkerId) -> StateResult<WorkerIdEntry> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;
        read_worker_entry(&table, worker_id)
    }

    /// Summarize the registry.
    pub fn worker_id_usage(&self) -> StateResult<WorkerIdUsage> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKER_IDS).map_err(map_err!(Table))?;
        let mut usage = WorkerIdUsage::default();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let entry: WorkerIdEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if entry.is_tombstoned {
                usage.tombstoned += 1;
            } else if entry.assigned_instance_id.is_some() {
                usage.assigned += 1;
            } else {
                usage.free += 1;
            }
        }
        Ok(usage)
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Fold one probe observation into the instance's health record.
    pub fn record_probe(
        &self,
        id: InstanceId,
        observation: &ProbeObservation,
    ) -> StateResult<HealthRecord> {
        let key = instance_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
            let previous = read_json::<HealthRecord>(&table, &key)?;
            let failures = previous.map(|r| r.consecutive_failures).unwrap_or(0);
            let record = if observation.healthy {
                HealthRecord {
                    instance_id: id,
                    is_healthy: true,
                    consecutive_failures: 0,
                    last_check_at: epoch_secs(),
                    response_time_ms: observation.latency_ms,
                    error_message: None,
                }
            } else {
                HealthRecord {
                    instance_id: id,
                    is_healthy: false,
                    consecutive_failures: failures.saturating_add(1),
                    last_check_at: epoch_secs(),
                    response_time_ms: observation.latency_ms,
                    error_message: observation.error.clone(),
                }
            };
            write_json(&mut table, &key, &record)?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Get the health record for an instance.
    pub fn get_health(&self, id: InstanceId) -> StateResult<Option<HealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
        read_json(&table, &instance_key(id))
    }

    /// List every health record.
    pub fn list_health(&self) -> StateResult<Vec<HealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
        scan_json(&table, None)
    }

    // ── Provisioning events ────────────────────────────────────────

    /// Append an audit row. Rows are never updated afterwards.
    pub fn append_event(&self, event: &ProvisioningEvent) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let seq = counters
                .get(EVENT_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            counters.insert(EVENT_SEQ, seq).map_err(map_err!(Write))?;

            let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            write_json(&mut events, &event_key(event.instance_id, seq), event)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// All events for an instance in insertion order.
    pub fn list_events(&self, id: InstanceId) -> StateResult<Vec<ProvisioningEvent>> {
        let prefix = format!("{}:", instance_key(id));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        scan_json(&table, Some(&prefix))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
