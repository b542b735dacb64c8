//! Undo/redo operation log.
//!
//! Each edit is logged as a `{forward, revert}` pair under `_Operation:<id>`,
//! with the ordered id list under `_Operation`. The log lives in its own
//! FIFO eviction cache whose budget is the configured memory limit, so old
//! history is dropped first. The id list and the record under the cursor are
//! pinned; a write that pushes the log over budget still commits and comes
//! back with a warning.
//!
//! The cursor is in-memory only. A fresh controller starts with no history.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{KvError, KvResult};
use crate::eviction::{EvictionCache, EvictionPolicy};
use crate::store::{BackingStore, MemoryStore};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One replayable edit.
///
/// Serialized as a tagged array: `["set", key, value]`, `["delete", key]`,
/// `["clean"]`, `["load", path]`, `["loads", json]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Set(String, Value),
    Delete(String),
    Clean,
    /// Replace the store with the snapshot file at this path
    Load(String),
    /// Replace the store with this snapshot string
    Loads(String),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Set(..) => "set",
            Operation::Delete(_) => "delete",
            Operation::Clean => "clean",
            Operation::Load(_) => "load",
            Operation::Loads(_) => "loads",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Operation::Set(key, value) => json!(["set", key, value]),
            Operation::Delete(key) => json!(["delete", key]),
            Operation::Clean => json!(["clean"]),
            Operation::Load(path) => json!(["load", path]),
            Operation::Loads(snapshot) => json!(["loads", snapshot]),
        }
    }

    pub fn from_value(value: &Value) -> KvResult<Self> {
        let bad = || KvError::InvalidOperation(value.to_string());
        let items = value.as_array().ok_or_else(bad)?;
        let name = items.first().and_then(Value::as_str).ok_or_else(bad)?;
        let text = |i: usize| {
            items
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(bad)
        };
        match (name, items.len()) {
            ("set", 3) => Ok(Operation::Set(text(1)?, items[2].clone())),
            ("delete", 2) => Ok(Operation::Delete(text(1)?)),
            ("clean", 1) => Ok(Operation::Clean),
            ("load", 2) => Ok(Operation::Load(text(1)?)),
            ("loads", 2) => Ok(Operation::Loads(text(1)?)),
            _ => Err(bad()),
        }
    }

    /// Apply this operation to a store.
    pub fn apply_to<S: BackingStore + ?Sized>(&self, store: &mut S) -> KvResult<()> {
        match self {
            Operation::Set(key, value) => store.set(key, value.clone()),
            Operation::Delete(key) => store.delete(key),
            Operation::Clean => store.clean(),
            Operation::Load(path) => store.load(std::path::Path::new(path)),
            Operation::Loads(snapshot) => store.loads(snapshot),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set(key, _) | Operation::Delete(key) => write!(f, "{} {}", self.name(), key),
            Operation::Load(path) => write!(f, "load {}", path),
            _ => f.write_str(self.name()),
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Operation::from_value(&value).map_err(D::Error::custom)
    }
}

/// Log entry: the edit and the edit that undoes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub forward: Operation,
    /// `None` when the edit had nothing to undo (deleting a missing key)
    pub revert: Option<Operation>,
}

/// Version log with a movable cursor.
pub struct VersionController {
    store: EvictionCache<MemoryStore>,
    /// Ids of records the cache evicted since the last settle
    evicted: Arc<Mutex<Vec<String>>>,
    current: Option<String>,
    limit_mb: f64,
}

impl VersionController {
    pub const TABLENAME: &'static str = "_Operation";

    /// Controller whose log may use up to `limit_mb` megabytes.
    pub fn new(limit_mb: f64) -> KvResult<Self> {
        if !(limit_mb.is_finite() && limit_mb > 0.0) {
            return Err(KvError::InvalidConfig(format!(
                "version log limit must be a positive number of MB, got {}",
                limit_mb
            )));
        }
        let budget = ((limit_mb * BYTES_PER_MB) as usize).max(1);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let prefix = format!("{}:", Self::TABLENAME);
        let mut store = EvictionCache::new(MemoryStore::new(), budget, EvictionPolicy::Fifo)?
            .on_evict(move |key, _| {
                if let Some(id) = key.strip_prefix(&prefix) {
                    sink.lock().push(id.to_string());
                }
            });
        store.pin(Self::TABLENAME);
        Ok(Self {
            store,
            evicted,
            current: None,
            limit_mb,
        })
    }

    fn record_key(id: &str) -> String {
        format!("{}:{}", Self::TABLENAME, id)
    }

    pub fn limit_mb(&self) -> f64 {
        self.limit_mb
    }

    /// Version ids, oldest first.
    pub fn get_versions(&self) -> KvResult<Vec<String>> {
        match self.store.get(Self::TABLENAME)? {
            Some(list) => Ok(serde_json::from_value(list)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_current_version(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// The logged record for `id`, if it is still in the log.
    pub fn record(&self, id: &str) -> KvResult<Option<OperationRecord>> {
        match self.store.get(&Self::record_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// Footprint of the log in MB.
    pub fn memory_usage_mb(&self) -> f64 {
        self.store.current_bytes() as f64 / BYTES_PER_MB
    }

    fn save_versions(&mut self, versions: &[String]) -> KvResult<()> {
        self.store.set(Self::TABLENAME, json!(versions))
    }

    /// Move the cursor and its pin together.
    fn move_cursor(&mut self, id: Option<String>) {
        if let Some(old) = self.current.take() {
            self.store.unpin(&Self::record_key(&old));
        }
        if let Some(new) = &id {
            self.store.pin(&Self::record_key(new));
        }
        self.current = id;
    }

    /// Drop evicted ids from the version list until no more evictions come in.
    fn settle(&mut self) -> KvResult<()> {
        loop {
            let evicted = std::mem::take(&mut *self.evicted.lock());
            if evicted.is_empty() {
                return Ok(());
            }
            if let Some(current) = &self.current {
                if evicted.contains(current) {
                    return Err(KvError::CurrentVersionEvicted(current.clone()));
                }
            }
            debug!(count = evicted.len(), "operation log dropped old versions");
            let mut versions = self.get_versions()?;
            versions.retain(|id| !evicted.contains(id));
            self.save_versions(&versions)?;
        }
    }

    fn current_index(&self, versions: &[String]) -> Option<usize> {
        let current = self.current.as_ref()?;
        versions.iter().position(|id| id == current)
    }

    /// Log an edit after the cursor, discarding any redo history past it.
    ///
    /// Returns a warning when the log is over its memory limit. The edit is
    /// logged either way.
    pub fn add_operation(
        &mut self,
        forward: Operation,
        revert: Option<Operation>,
    ) -> KvResult<Option<String>> {
        let mut versions = self.get_versions()?;
        if let Some(index) = self.current_index(&versions) {
            for stale in versions.split_off(index + 1) {
                self.store.delete(&Self::record_key(&stale))?;
            }
        }

        let id = Uuid::new_v4().to_string();
        versions.push(id.clone());
        self.move_cursor(Some(id.clone()));
        let record = serde_json::to_value(OperationRecord { forward, revert })?;
        self.store.set(&Self::record_key(&id), record)?;
        self.save_versions(&versions)?;
        self.settle()?;

        let usage = self.memory_usage_mb();
        if usage > self.limit_mb {
            let message = format!(
                "[LocalVersionController] Warning: memory usage {:.1} MB exceeds limit of {:.1} MB",
                usage, self.limit_mb
            );
            warn!(
                usage_mb = usage,
                limit_mb = self.limit_mb,
                "operation log over its memory limit"
            );
            return Ok(Some(message));
        }
        Ok(None)
    }

    /// Drop up to `n` records: oldest first, or newest first when the cursor
    /// sits on the oldest record. The cursor falls back to the last survivor.
    pub fn pop_operation(&mut self, n: usize) -> KvResult<Vec<(String, OperationRecord)>> {
        let mut versions = self.get_versions()?;
        let mut popped = Vec::new();
        for _ in 0..n.min(versions.len()) {
            let at_oldest = self.current.is_some() && versions.first() == self.current.as_ref();
            let index = if at_oldest { versions.len() - 1 } else { 0 };
            let id = versions.remove(index);
            if let Some(record) = self.record(&id)? {
                popped.push((id.clone(), record));
            }
            self.store.unpin(&Self::record_key(&id));
            self.store.delete(&Self::record_key(&id))?;
        }
        self.save_versions(&versions)?;

        if self.current_index(&versions).is_none() {
            self.move_cursor(versions.last().cloned());
        }
        self.settle()?;
        Ok(popped)
    }

    /// Replay the record after the cursor. Returns whether the cursor moved.
    pub fn forward_one_operation<F>(&mut self, mut apply: F) -> KvResult<bool>
    where
        F: FnMut(&Operation) -> KvResult<()>,
    {
        let versions = self.get_versions()?;
        let next = match self.current_index(&versions) {
            Some(index) => index + 1,
            None => 0,
        };
        let Some(id) = versions.get(next) else {
            return Ok(false);
        };
        let Some(record) = self.record(id)? else {
            return Ok(false);
        };
        apply(&record.forward)?;
        self.move_cursor(Some(id.clone()));
        Ok(true)
    }

    /// Undo the record under the cursor. The first record cannot be undone.
    /// Returns whether the cursor moved.
    pub fn revert_one_operation<F>(&mut self, mut apply: F) -> KvResult<bool>
    where
        F: FnMut(&Operation) -> KvResult<()>,
    {
        let versions = self.get_versions()?;
        let Some(index) = self.current_index(&versions).filter(|&i| i > 0) else {
            return Ok(false);
        };
        let Some(revert) = self.record(&versions[index])?.and_then(|r| r.revert) else {
            return Ok(false);
        };
        apply(&revert)?;
        self.move_cursor(Some(versions[index - 1].clone()));
        Ok(true)
    }

    /// Step forward or back until the cursor is on `target`.
    pub fn to_version<F>(&mut self, target: &str, mut apply: F) -> KvResult<()>
    where
        F: FnMut(&Operation) -> KvResult<()>,
    {
        let versions = self.get_versions()?;
        let Some(target_index) = versions.iter().position(|id| id == target) else {
            return Err(KvError::UnknownVersion(target.to_string()));
        };
        loop {
            let index = self.current_index(&versions);
            if index == Some(target_index) {
                return Ok(());
            }
            let forward = index.map_or(true, |i| i < target_index);
            let moved = if forward {
                self.forward_one_operation(&mut apply)?
            } else {
                self.revert_one_operation(&mut apply)?
            };
            if !moved {
                return Err(KvError::VersionStuck {
                    from: self.current.clone().unwrap_or_else(|| "<none>".to_string()),
                    target: target.to_string(),
                    reason: if forward {
                        "next record is missing".to_string()
                    } else {
                        "record has no revert operation".to_string()
                    },
                });
            }
        }
    }

    /// Undo and discard the newest record if the cursor is on it.
    ///
    /// Unlike [`revert_one_operation`](Self::revert_one_operation) this also
    /// works on the first record, and the undone edit is gone from history
    /// rather than left for redo.
    pub fn revert_latest<F>(&mut self, mut apply: F) -> KvResult<bool>
    where
        F: FnMut(&Operation) -> KvResult<()>,
    {
        let mut versions = self.get_versions()?;
        let Some(latest) = versions.last().cloned() else {
            return Ok(false);
        };
        if self.current.as_ref() != Some(&latest) {
            return Ok(false);
        }
        if let Some(revert) = self.record(&latest)?.and_then(|r| r.revert) {
            apply(&revert)?;
        }
        versions.pop();
        self.move_cursor(versions.last().cloned());
        self.store.delete(&Self::record_key(&latest))?;
        self.save_versions(&versions)?;
        self.settle()?;
        Ok(true)
    }
}

impl fmt::Debug for VersionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionController")
            .field("current", &self.current)
            .field("limit_mb", &self.limit_mb)
            .field("usage_mb", &self.memory_usage_mb())
            .finish()
    }
}
