//! Error types for the record layer

use layerkv_core::KvError;
use thiserror::Error;

use crate::kinds::RecordKind;

#[derive(Debug, Error)]
pub enum RecordError {
    /// The storage engine refused a read or write
    #[error(transparent)]
    Storage(#[from] KvError),

    /// Id is not `<Kind>:<uuid>`
    #[error("malformed record id {0:?}: expected `Object:<uuid>` or `Group:<uuid>`")]
    InvalidId(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("record {0} already exists")]
    AlreadyExists(String),

    /// The record exists but is of the wrong kind for the operation
    #[error("record {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: String,
        expected: RecordKind,
        actual: RecordKind,
    },

    /// Stored value does not decode into a record of the kind its id names
    #[error("record {id} could not be decoded: {reason}")]
    Decode { id: String, reason: String },

    /// An update tried to change a record's id
    #[error("record id is immutable ({from} -> {to})")]
    IdChanged { from: String, to: String },
}

/// Result type alias for record operations
pub type RecordResult<T> = Result<T, RecordError>;
