//! Backing-store contract and the in-process map adapter.
//!
//! Every layer of the engine talks to storage through [`BackingStore`]. An
//! adapter only has to provide the five primitives; the bulk snapshot and
//! file helpers are built generically on top of them.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;
use wildmatch::WildMatch;

use crate::error::{KvError, KvResult};
use crate::size::entry_size;

/// Minimal key-value contract every adapter implements.
///
/// `keys` takes an anchored glob where `*` matches any run of characters.
/// Iteration order is whatever the adapter keeps; the in-process map keeps
/// insertion order.
pub trait BackingStore {
    fn exists(&self, key: &str) -> KvResult<bool>;
    fn set(&mut self, key: &str, value: Value) -> KvResult<()>;
    fn get(&self, key: &str) -> KvResult<Option<Value>>;
    fn delete(&mut self, key: &str) -> KvResult<()>;
    fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Delete every key.
    fn clean(&mut self) -> KvResult<()> {
        for key in self.keys("*")? {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// Serialize every live key into one JSON object string.
    fn dumps(&self) -> KvResult<String> {
        let mut map = Map::new();
        for key in self.keys("*")? {
            if let Some(value) = self.get(&key)? {
                map.insert(key, value);
            }
        }
        Ok(Value::Object(map).to_string())
    }

    /// Replace the whole store with the keys of a JSON object string.
    fn loads(&mut self, json: &str) -> KvResult<()> {
        let snapshot = parse_snapshot(json)?;
        self.clean()?;
        for (key, value) in snapshot {
            self.set(&key, value)?;
        }
        Ok(())
    }

    /// Write `dumps()` to a file.
    fn dump(&self, path: &Path) -> KvResult<()> {
        let json = self.dumps()?;
        std::fs::write(path, json).map_err(|e| KvError::from(e).with_path(path))
    }

    /// Replace the store with the snapshot in a file.
    fn load(&mut self, path: &Path) -> KvResult<()> {
        let json = std::fs::read_to_string(path).map_err(|e| KvError::from(e).with_path(path))?;
        self.loads(&json)
    }

    /// Estimated footprint of all entries.
    fn bytes_used(&self) -> KvResult<usize> {
        let mut total = 0;
        for key in self.keys("*")? {
            if let Some(value) = self.get(&key)? {
                total += entry_size(&key, &value);
            }
        }
        Ok(total)
    }
}

/// A store shared by several layers (the dispatcher and the queue share one).
pub type SharedStore = Arc<Mutex<dyn BackingStore + Send>>;

/// Put a store behind a [`SharedStore`] handle.
pub fn shared<S: BackingStore + Send + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Parse a snapshot string, which must be a JSON object.
pub fn parse_snapshot(json: &str) -> KvResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(map) => Ok(map),
        other => Err(KvError::Json(format!(
            "snapshot must be a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Box<S> {
    fn exists(&self, key: &str) -> KvResult<bool> {
        (**self).exists(key)
    }
    fn set(&mut self, key: &str, value: Value) -> KvResult<()> {
        (**self).set(key, value)
    }
    fn get(&self, key: &str) -> KvResult<Option<Value>> {
        (**self).get(key)
    }
    fn delete(&mut self, key: &str) -> KvResult<()> {
        (**self).delete(key)
    }
    fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        (**self).keys(pattern)
    }
    fn clean(&mut self) -> KvResult<()> {
        (**self).clean()
    }
    fn dumps(&self) -> KvResult<String> {
        (**self).dumps()
    }
    fn loads(&mut self, json: &str) -> KvResult<()> {
        (**self).loads(json)
    }
    fn bytes_used(&self) -> KvResult<usize> {
        (**self).bytes_used()
    }
}

/// In-process map adapter. Keeps keys in insertion order.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    id: Uuid,
    data: IndexMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            data: IndexMap::new(),
        }
    }

    /// Instance id, distinct for every store.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryStore {
    fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.data.contains_key(key))
    }

    fn set(&mut self, key: &str, value: Value) -> KvResult<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> KvResult<Option<Value>> {
        Ok(self.data.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        // shift_remove keeps the remaining keys in insertion order
        self.data.shift_remove(key);
        Ok(())
    }

    fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let matcher = WildMatch::new(pattern);
        Ok(self
            .data
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect())
    }

    fn clean(&mut self) -> KvResult<()> {
        self.data.clear();
        Ok(())
    }
}
