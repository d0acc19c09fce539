//! hostgrid-health — health probing and reconciliation for tenant instances.
//!
//! Two background loops share nothing but the state store:
//!
//! ```text
//! HealthMonitor ──probe every Running instance──▶ HealthRecord
//!                                                    │
//! Reconciler ◀────────────reads──────────────────────┘
//!   ├── consecutive failures > threshold ─▶ escalate (and suspend)
//!   ├── container / database missing     ─▶ drift
//!   └── leftover infrastructure           ─▶ orphaned_at
//! ```
//!
//! The monitor only records what it saw. Status changes come from the
//! reconciler, through the orchestrator.

pub mod checker;
pub mod monitor;
pub mod reconciler;

pub use checker::{HealthVerifier, HttpVerifier};
pub use monitor::{HealthMonitor, SweepSummary};
pub use reconciler::{Drift, ReconcileReport, Reconciler};
