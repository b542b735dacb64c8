//! The record model stored under `<Kind>:<uuid>` keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RecordError, RecordResult};
use crate::kinds::RecordKind;

/// Fields only groups carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBody {
    pub author_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Direct children in insertion order
    #[serde(default)]
    pub children_id: Vec<String>,
}

/// Kind-specific part of a record, tagged with its kind in the stored JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RecordBody {
    Object,
    Group(GroupBody),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Object => RecordKind::Object,
            RecordBody::Group(_) => RecordKind::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub rank: Vec<i32>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub body: RecordBody,
}

impl Record {
    fn with_body(body: RecordBody) -> Self {
        let now = Utc::now();
        Self {
            id: body.kind().new_id(),
            rank: vec![0],
            create_time: now,
            update_time: now,
            status: String::new(),
            metadata: BTreeMap::new(),
            body,
        }
    }

    /// A new object record with a fresh id.
    pub fn object() -> Self {
        Self::with_body(RecordBody::Object)
    }

    /// A new, empty group record with a fresh id.
    pub fn group(author_id: impl Into<String>) -> Self {
        Self::with_body(RecordBody::Group(GroupBody {
            author_id: author_id.into(),
            ..GroupBody::default()
        }))
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    pub fn group_body(&self) -> Option<&GroupBody> {
        match &self.body {
            RecordBody::Group(body) => Some(body),
            RecordBody::Object => None,
        }
    }

    pub fn group_body_mut(&mut self) -> Option<&mut GroupBody> {
        match &mut self.body {
            RecordBody::Group(body) => Some(body),
            RecordBody::Object => None,
        }
    }

    /// Direct child ids; empty for objects.
    pub fn children_id(&self) -> &[String] {
        self.group_body().map(|g| g.children_id.as_slice()).unwrap_or(&[])
    }

    pub fn touch(&mut self) {
        self.update_time = Utc::now();
    }

    /// Apply `status` and free-form properties: `status` sets the status,
    /// every other key lands in `metadata`.
    pub fn apply_properties<I, K, V>(&mut self, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in properties {
            let key = key.into();
            if key == "status" {
                self.status = value.into();
            } else {
                self.metadata.insert(key, value.into());
            }
        }
    }

    pub fn to_value(&self) -> RecordResult<Value> {
        serde_json::to_value(self).map_err(|e| RecordError::Decode {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode the value stored under `id`, checking that the body matches the
    /// kind the id names.
    pub fn from_value(id: &str, value: Value) -> RecordResult<Self> {
        let expected = RecordKind::from_id(id)?;
        let record: Record = serde_json::from_value(value).map_err(|e| RecordError::Decode {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if record.id != id {
            return Err(RecordError::Decode {
                id: id.to_string(),
                reason: format!("stored id is {}", record.id),
            });
        }
        if record.kind() != expected {
            return Err(RecordError::Decode {
                id: id.to_string(),
                reason: format!("body is a {}", record.kind()),
            });
        }
        Ok(record)
    }
}
