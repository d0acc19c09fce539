//! Error types for the hostgrid instance store.

use thiserror::Error;

use crate::types::{InstanceId, InstanceStatus, WorkerId};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance {0} already exists")]
    AlreadyExists(InstanceId),

    #[error("domain '{0}' is already taken")]
    DomainTaken(String),

    #[error("instance {instance_id} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        instance_id: InstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("no free worker ids remain")]
    WorkerIdsExhausted,

    #[error("worker id {0} is outside the registry")]
    UnknownWorkerId(WorkerId),
}
