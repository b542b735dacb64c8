//! Record kinds and the `<Kind>:<uuid>` id scheme.
//!
//! The kind of a record is recoverable from its key alone, so a key listing
//! is enough to know how to decode every value in it.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{RecordError, RecordResult};

/// Every record kind the store knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Object,
    Group,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Object, RecordKind::Group];

    /// Key prefix, without the separator.
    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::Object => "Object",
            RecordKind::Group => "Group",
        }
    }

    /// Glob matching every key of this kind.
    pub fn pattern(self) -> String {
        format!("{}:*", self.prefix())
    }

    /// Fresh `<Kind>:<uuid v4>` id.
    pub fn new_id(self) -> String {
        format!("{}:{}", self.prefix(), Uuid::new_v4())
    }

    /// Kind named by an id's prefix. The suffix must be a uuid.
    pub fn from_id(id: &str) -> RecordResult<Self> {
        let (prefix, suffix) = id
            .split_once(':')
            .ok_or_else(|| RecordError::InvalidId(id.to_string()))?;
        if Uuid::parse_str(suffix).is_err() {
            return Err(RecordError::InvalidId(id.to_string()));
        }
        prefix.parse().map_err(|_| RecordError::InvalidId(id.to_string()))
    }
}

impl FromStr for RecordKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.prefix() == s)
            .ok_or_else(|| RecordError::InvalidId(s.to_string()))
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
