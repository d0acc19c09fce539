//! hostgrid-state — the durable instance store.
//!
//! Backed by [redb](https://docs.rs/redb), holds instances, their
//! infrastructure records, the worker-id registry, health records and the
//! provisioning event log.
//!
//! # Concurrency
//!
//! redb serializes write transactions, so every read-check-write the
//! orchestrator relies on (claiming the lowest free worker id, claiming a
//! Pending instance, version-checked status writes, domain uniqueness)
//! runs inside a single write transaction and is atomic.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
