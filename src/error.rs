//! Engine errors and script fault taxonomy

use thiserror::Error;

/// Persistence result
pub type PersistResult<T> = Result<T, PersistError>;

/// Messages with this prefix are delivered privately to the owner instead
/// of being said at the object's locale.
pub const OWNER_PREFIX: &str = "owner>";

/// A recognized scripting-language runtime error.
///
/// These are classified faults: they are reported in-world (locale or
/// owner, by message prefix) and park the instance pending a manual reset.
#[derive(Debug, Clone, Error)]
pub enum RuntimeFault {
    #[error("Stack overflow")]
    StackOverflow,

    #[error("Heap limit exceeded: {used} of {limit} bytes")]
    HeapExceeded { used: usize, limit: usize },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Index out of bounds")]
    IndexOutOfBounds,

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Runtime error: {0}")]
    Other(String),
}

impl RuntimeFault {
    /// Whether the in-world report goes privately to the owner.
    #[inline]
    pub fn owner_only(&self) -> bool {
        self.to_string().starts_with(OWNER_PREFIX)
    }
}

/// Why a handler slice ended in something other than normal progress.
#[derive(Debug, Clone, Error)]
pub enum ScriptFault {
    /// Script asked to be removed from its host inventory.
    #[error("script requested self-delete")]
    SelfDelete,

    /// Script asked for its entire host object to be destroyed.
    #[error("script requested host death")]
    Die,

    /// Script asked to reset itself.
    #[error("script requested self-reset")]
    SelfReset,

    /// Classified runtime fault, reported in-world.
    #[error(transparent)]
    Runtime(#[from] RuntimeFault),

    /// Anything else that escaped the handler, logged in full and
    /// summarized to the owner.
    #[error("internal fault: {0}")]
    Internal(String),
}

/// Durable-state encode/decode errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("Unsupported state version {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed state blob: {0}")]
    Malformed(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Lifecycle errors surfaced by the scheduler API.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unknown instance {0}")]
    UnknownInstance(u32),

    #[error("Instance is disposed")]
    Disposed,

    #[error("Reset did not quiesce the instance in time")]
    ResetTimeout,
}
