//! Engine error taxonomy.

use uuid::Uuid;

use crate::expr::ExprError;
use crate::persistence::StoreError;

/// Errors raised by engine handlers.
///
/// Validation variants surface to the caller before any execution is
/// created. [`EngineError::Store`] wrapping a transient failure is retried
/// by the db-retry decorator; anything else inside a handler converts into a
/// state transition (task or workflow moves to ERROR with the message as
/// `state_info`).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Expression evaluation error
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// Entity referenced by the caller does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Workflow or task specification is structurally invalid
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Referenced action cannot be resolved
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Workflow input does not match the declared parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation is not legal in the current execution state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the operation may succeed if repeated (deadlock,
    /// serialization failure).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(StoreError::Transient(_)))
    }

    pub fn workflow_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "workflow execution",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "task execution",
            id: id.to_string(),
        }
    }

    pub fn action_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "action execution",
            id: id.to_string(),
        }
    }

    pub fn definition_not_found(name: &str, namespace: &str) -> Self {
        Self::NotFound {
            kind: "workflow definition",
            id: format!("{}/{}", namespace, name),
        }
    }
}
