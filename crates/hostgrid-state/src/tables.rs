//! redb table definitions for the hostgrid instance store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Instance ids are zero-padded in keys so that lexical order is
//! numeric order.

use redb::TableDefinition;

/// Instances keyed by `{instance_id:020}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Domain index: domain → owning instance id, for non-destroyed instances.
pub const DOMAINS: TableDefinition<&str, i64> = TableDefinition::new("domains");

/// Infrastructure records keyed by `{instance_id:020}`.
pub const INFRASTRUCTURE: TableDefinition<&str, &[u8]> = TableDefinition::new("infrastructure");

/// Worker-id registry keyed by worker id; pre-seeded with the full space.
pub const WORKER_IDS: TableDefinition<u16, &[u8]> = TableDefinition::new("worker_ids");

/// Health records keyed by `{instance_id:020}`.
pub const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("health");

/// Provisioning events keyed by `{instance_id:020}:{seq:020}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Monotonic counters.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

pub const EVENT_SEQ: &str = "event_seq";
