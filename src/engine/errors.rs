use thiserror::Error;

use crate::engine::types::FlowStatus;
use crate::storage::StoreError;

/// Errors surfaced at the engine boundary. `code()` gives the symbolic
/// wire form for external callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow not found: {0}")]
    NotFound(String),

    #[error("cannot {op} a {status} flow")]
    InvalidTransition { op: &'static str, status: FlowStatus },

    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    #[error("flow type '{0}' is already registered with different definitions")]
    DuplicateRegistration(String),

    #[error("version conflict on flow {0}")]
    Conflict(String),

    #[error("catalog drift: {0}")]
    CatalogDrift(String),

    #[error("branch nesting on step '{step}' exceeds the configured maximum of {max}")]
    BranchNestingExceeded { step: String, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFound",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::UnknownFlowType(_) => "UnknownFlowType",
            EngineError::DuplicateRegistration(_) => "DuplicateRegistration",
            EngineError::Conflict(_) => "Conflict",
            EngineError::CatalogDrift(_) => "CatalogDrift",
            EngineError::BranchNestingExceeded { .. } => "BranchNestingExceeded",
            EngineError::Store(StoreError::VersionConflict { .. }) => "Conflict",
            EngineError::Store(StoreError::NotFound { .. }) => "NotFound",
            EngineError::Store(_) => "EngineError",
            EngineError::Internal(_) => "EngineError",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
