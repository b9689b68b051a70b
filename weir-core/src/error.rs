//! Engine error taxonomy.
//!
//! Every failure a command can surface falls into one of a small set of
//! categories with distinct recovery semantics: `Conflict` is retryable by
//! re-running the whole command, `NotFound` is a stale reference and never
//! retried, `HandlerFailure` is recorded on the job, and everything else is
//! fatal for the command that raised it.

use thiserror::Error;
use uuid::Uuid;

use crate::graph::GraphError;
use crate::store::EntityKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A write's expected revision did not match the stored one. The caller
    /// may retry the whole command from scratch.
    #[error("optimistic locking failure on {kind} {id}")]
    Conflict { kind: EntityKind, id: Uuid },

    /// A referenced entity is absent. Indicates a stale caller reference or
    /// a logic error upstream; never retried.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    /// A process definition could not be resolved by id, key or deployment.
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    /// The target of a trigger is suspended; the operation is rejected.
    #[error("{0} is suspended")]
    Suspended(String),

    /// A job or timer handler raised an error. Recorded on the job and
    /// retried until its retry budget is exhausted.
    #[error("job handler failed: {0}")]
    HandlerFailure(String),

    /// The agenda attempted a structurally invalid step, e.g. joining a
    /// scope with no matching fork. Fatal for the current command.
    #[error("illegal graph state: {0}")]
    IllegalGraphState(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("variable serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True when re-running the enclosing command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    pub(crate) fn not_found(kind: EntityKind, id: Uuid) -> Self {
        EngineError::NotFound { kind, id }
    }
}

/// Failures raised by a [`ProcessStore`](crate::store::ProcessStore)
/// implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision conflict on {kind} {id}: expected {expected}, stored {actual}")]
    Conflict {
        kind: EntityKind,
        id: Uuid,
        expected: i32,
        actual: i32,
    },

    #[error("{kind} {id} already exists")]
    DuplicateId { kind: EntityKind, id: Uuid },

    /// The target of an update or delete no longer exists. Treated as a
    /// conflict by the command pipeline: somebody else removed it first.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("payload {0} is not stored")]
    MissingPayload(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
