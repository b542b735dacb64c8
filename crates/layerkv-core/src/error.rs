//! Error types for layerkv operations
//!
//! All engine errors are represented by the KvError enum. Internal layers
//! return `KvResult`; the storage facade decides which ones are surfaced and
//! which ones degrade to empty results.

use std::path::PathBuf;

use thiserror::Error;

/// layerkv error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// I/O operation failed (file dump/load)
    #[error("I/O error{}: {message} ({kind})", located(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A value or snapshot could not be (de)serialized as JSON
    #[error("JSON error: {0}")]
    Json(String),

    /// Eviction policy name not recognised
    #[error("invalid eviction policy {0:?}: expected \"lru\" or \"fifo\"")]
    InvalidPolicy(String),

    /// Modulus too small to carry at least one plaintext byte per block
    #[error("the modulus is too small ({bits} bits); use a larger key size")]
    ModulusTooSmall {
        /// Bit length of the rejected modulus
        bits: u64,
    },

    /// The cipher was asked to use a key half it was not given
    #[error("{0} key required for this operation")]
    MissingKey(&'static str),

    /// Ciphertext did not decrypt to a well-formed payload
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Ciphertext framing (base64 blocks, `|` separators) is malformed
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// `to_version` target is not in the version list
    #[error("no such version {0}")]
    UnknownVersion(String),

    /// The log cache evicted the record the cursor points at
    #[error("version {0} is the current version and was evicted from the operation log")]
    CurrentVersionEvicted(String),

    /// Version navigation could not make progress toward its target
    #[error("cannot move from version {from} toward {target}: {reason}")]
    VersionStuck {
        /// Cursor position when navigation stalled
        from: String,
        /// Requested target
        target: String,
        /// Why the step was refused
        reason: String,
    },

    /// A version-log record is malformed
    #[error("invalid operation record: {0}")]
    InvalidOperation(String),

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `add_slave` was asked to mirror an event it cannot replay
    #[error("unsupported slave event {0:?}")]
    UnsupportedEvent(String),

    /// Failure reported by a backing-store adapter
    #[error("backend error: {0}")]
    Backend(String),

    /// One or more slave listeners refused an edit
    #[error("replication failed for {failed} listener(s): {detail}")]
    Replication {
        /// Number of failing listeners
        failed: usize,
        /// First failure message
        detail: String,
    },
}

impl KvError {
    /// Attach a path to an I/O error produced by a plain `?` conversion.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            KvError::Io { kind, message, .. } => KvError::Io {
                path: Some(path.into()),
                kind,
                message,
            },
            other => other,
        }
    }
}

/// Convert std::io::Error to KvError::Io
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Json(err.to_string())
    }
}

fn located(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

/// Result type alias for layerkv operations
pub type KvResult<T> = Result<T, KvError>;
