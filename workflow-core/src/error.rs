//! Error taxonomy. One `thiserror` enum per crate boundary: one variant per
//! failure mode, `#[from]` conversions at the edges so call sites can use
//! `?` freely.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: version mismatch writing {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("message not found: {0}")]
    NotFound(String),
}

/// §7's failure taxonomy modeled directly as an enum so dispatch code matches
/// on it instead of string-sniffing an adapter error message.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("transient adapter error: {0}")]
    Transient(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("authorization failure: {0}")]
    Authz(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("node execution timed out after {0}s")]
    Timeout(u64),
    #[error("engine invariant violated: {0}")]
    Invariant(String),
    #[error("run {0} was cancelled")]
    Cancelled(String),
}
