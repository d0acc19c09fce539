//! Error types for the lifecycle orchestrator.

use hostgrid_core::SnowflakeError;
use hostgrid_crypto::CryptoError;
use hostgrid_state::{InstanceId, StateError};
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Stable codes carried by [`OrchestratorError::Conflict`].
pub mod conflict {
    /// Another non-destroyed instance already holds the domain.
    pub const SUBDOMAIN_TAKEN: &str = "SUBDOMAIN_TAKEN";
    /// The instance changed between read and write.
    pub const CONCURRENT_MODIFICATION: &str = "CONCURRENT_MODIFICATION";
    /// The instance is already destroyed.
    pub const INSTANCE_DESTROYED: &str = "INSTANCE_DESTROYED";
    /// The operation is not allowed from the instance's current status.
    pub const INVALID_STATE: &str = "INVALID_STATE";
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("quota exceeded: tier '{tier}' allows {limit} instance(s)")]
    QuotaExceeded { tier: String, limit: u32 },

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("step '{step}' failed: {message}")]
    Infrastructure { step: &'static str, message: String },

    #[error("cryptographic failure: {0}")]
    Cryptographic(#[from] CryptoError),

    #[error("id generation failed: {0}")]
    ClockDrift(#[from] SnowflakeError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("queue error: {0}")]
    Queue(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl OrchestratorError {
    pub fn not_found(id: InstanceId) -> Self {
        Self::NotFound(format!("instance {id}"))
    }

    /// The conflict code, if this is a conflict.
    pub fn conflict_code(&self) -> Option<&'static str> {
        match self {
            Self::Conflict(code) => Some(code),
            _ => None,
        }
    }
}

impl From<StateError> for OrchestratorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::DomainTaken(_) => Self::Conflict(conflict::SUBDOMAIN_TAKEN),
            StateError::VersionConflict { .. } => Self::Conflict(conflict::CONCURRENT_MODIFICATION),
            StateError::InvalidTransition { .. } => Self::Conflict(conflict::INVALID_STATE),
            StateError::WorkerIdsExhausted => Self::ResourceExhausted(err.to_string()),
            StateError::NotFound(what) => Self::NotFound(what),
            other => Self::State(other),
        }
    }
}
