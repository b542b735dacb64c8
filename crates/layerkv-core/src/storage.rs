//! Storage facade: the public surface of layerkv.
//!
//! [`KeyValueStorage`] composes one eviction-backed connection, an event
//! dispatcher, a version log, a message queue and an optional cipher.
//!
//! **Write path**: log `(forward, revert)` → apply locally (encrypting values)
//! → dispatch to listeners → on refusal, roll the local edit back
//! **Read path**: connection → decrypt envelope → caller
//!
//! Reads never touch the version log or the dispatcher. Errors stop at this
//! boundary: reads degrade to `None`/empty and writes to `false`, with the
//! detail logged. The `try_*` methods return the error instead.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cipher::ChunkCipher;
use crate::config::{Config, ReplicationPolicy};
use crate::error::{KvError, KvResult};
use crate::events::{DispatchReport, EventDispatcher};
use crate::eviction::EvictionCache;
use crate::queue::MessageQueue;
use crate::store::{parse_snapshot, BackingStore, MemoryStore};
use crate::version::{Operation, VersionController};

/// Any backing-store adapter.
pub type Connection = Box<dyn BackingStore + Send>;

/// Key marking an encrypted value: `{"rjson": "<ciphertext>"}`
pub const ENVELOPE_KEY: &str = "rjson";

/// Events a slave can mirror.
pub const SLAVE_EVENTS: [&str; 5] = ["set", "delete", "clean", "load", "loads"];

/// Events a slave mirrors unless told otherwise.
pub const DEFAULT_SLAVE_EVENTS: [&str; 2] = ["set", "delete"];

/// Ciphertext inside an envelope, if `value` is one.
fn envelope(value: &Value) -> Option<&str> {
    match value.as_object() {
        Some(map) if map.len() == 1 => map.get(ENVELOPE_KEY).and_then(Value::as_str),
        _ => None,
    }
}

fn seal(cipher: Option<&ChunkCipher>, value: Value) -> KvResult<Value> {
    match cipher {
        Some(cipher) => {
            let sealed = cipher.encrypt_string(&value.to_string(), true)?;
            Ok(json!({ ENVELOPE_KEY: sealed }))
        }
        None => Ok(value),
    }
}

/// Apply one edit to the connection, encrypting whatever it writes.
fn apply_local<S: BackingStore + ?Sized>(
    conn: &mut S,
    cipher: Option<&ChunkCipher>,
    op: &Operation,
) -> KvResult<()> {
    let replace = |conn: &mut S, snapshot: Map<String, Value>| -> KvResult<()> {
        conn.clean()?;
        for (key, value) in snapshot {
            conn.set(&key, seal(cipher, value)?)?;
        }
        Ok(())
    };
    match op {
        Operation::Set(key, value) => conn.set(key, seal(cipher, value.clone())?),
        Operation::Delete(key) => conn.delete(key),
        Operation::Clean => conn.clean(),
        Operation::Loads(json) => replace(conn, parse_snapshot(json)?),
        Operation::Load(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| KvError::from(e).with_path(path))?;
            replace(conn, parse_snapshot(&json)?)
        }
    }
}

/// Event payload announcing `op` to listeners.
fn payload(op: &Operation) -> Value {
    match op {
        Operation::Set(key, value) => json!({"key": key, "value": value}),
        Operation::Delete(key) => json!({"key": key}),
        Operation::Clean => json!({}),
        Operation::Load(path) => json!({"path": path}),
        Operation::Loads(snapshot) => json!({"json": snapshot}),
    }
}

/// Replay an announced edit on a slave.
fn replay(slave: &Mutex<KeyValueStorage>, event: &str, payload: &Value) -> Result<(), String> {
    let text = |field: &str| {
        payload
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("{} payload has no {:?}", event, field))
    };
    let op = match event {
        "set" => {
            let value = payload
                .get("value")
                .cloned()
                .ok_or_else(|| "set payload has no \"value\"".to_string())?;
            Operation::Set(text("key")?, value)
        }
        "delete" => Operation::Delete(text("key")?),
        "clean" => Operation::Clean,
        "load" => Operation::Load(text("path")?),
        "loads" => Operation::Loads(text("json")?),
        other => return Err(format!("cannot replay {:?}", other)),
    };
    // a replication cycle would deadlock here; slaves form chains, not loops
    let mut slave = slave.lock();
    slave.try_commit(op).map_err(|e| format!("slave {}: {}", slave.id(), e))
}

pub struct KeyValueStorage {
    id: Uuid,
    config: Config,
    conn: EvictionCache<Connection>,
    cipher: Option<Arc<ChunkCipher>>,
    events: EventDispatcher,
    versions: Option<VersionController>,
    queue: MessageQueue,
}

impl KeyValueStorage {
    /// Storage over a fresh in-process map.
    pub fn new(config: Config, cipher: Option<ChunkCipher>) -> KvResult<Self> {
        Self::with_backend(config, Box::new(MemoryStore::new()), cipher)
    }

    /// Storage over any adapter. Keys already in `backend` are adopted.
    pub fn with_backend(
        config: Config,
        backend: Connection,
        cipher: Option<ChunkCipher>,
    ) -> KvResult<Self> {
        config.validate().map_err(KvError::InvalidConfig)?;
        let (conn, events, versions, queue) = Self::build(&config, backend)?;
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            conn,
            cipher: cipher.map(Arc::new),
            events,
            versions,
            queue,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build(
        config: &Config,
        backend: Connection,
    ) -> KvResult<(
        EvictionCache<Connection>,
        EventDispatcher,
        Option<VersionController>,
        MessageQueue,
    )> {
        // validate() guarantees both budgets fit in usize
        let conn =
            EvictionCache::new(backend, config.cache_max_bytes as usize, config.cache_policy)?;
        let events = EventDispatcher::in_memory()?;
        let versions = if config.version_control {
            Some(VersionController::new(config.version_limit_mb)?)
        } else {
            None
        };
        let queue = MessageQueue::in_memory(config.queue_max_bytes as usize, config.queue_policy)?;
        Ok((conn, events, versions, queue))
    }

    /// Move onto another adapter. Listeners, version history and queues
    /// start over; the cipher is kept.
    pub fn switch_backend(&mut self, backend: Connection) -> KvResult<()> {
        let (conn, events, versions, queue) = Self::build(&self.config, backend)?;
        self.conn = conn;
        self.events = events;
        self.versions = versions;
        self.queue = queue;
        info!(storage = %self.id, "switched backend");
        Ok(())
    }

    /// Instance id; slave listener ids are derived from it.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cipher(&self) -> Option<&ChunkCipher> {
        self.cipher.as_deref()
    }

    // ---- write path ----

    fn inverse(&self, op: &Operation) -> KvResult<Option<Operation>> {
        Ok(match op {
            Operation::Set(key, _) => Some(match self.try_get(key)? {
                Some(old) => Operation::Set(key.clone(), old),
                None => Operation::Delete(key.clone()),
            }),
            Operation::Delete(key) => {
                self.try_get(key)?.map(|old| Operation::Set(key.clone(), old))
            }
            Operation::Clean | Operation::Load(_) | Operation::Loads(_) => {
                Some(Operation::Loads(self.try_dumps()?))
            }
        })
    }

    /// Run one edit through the full write path.
    ///
    /// The inverse is taken before the edit touches the connection, but the
    /// record is logged only once the edit applied, so a refused edit never
    /// truncates the redo history.
    pub fn try_commit(&mut self, forward: Operation) -> KvResult<()> {
        let revert = self.inverse(&forward)?;
        apply_local(&mut self.conn, self.cipher.as_deref(), &forward)?;

        if let Some(versions) = self.versions.as_mut() {
            if let Err(e) = versions.add_operation(forward.clone(), revert.clone()) {
                if let Some(op) = &revert {
                    apply_local(&mut self.conn, self.cipher.as_deref(), op)?;
                }
                return Err(e);
            }
        }

        let report = self.events.dispatch_event(forward.name(), &payload(&forward))?;
        if report.is_ok() {
            return Ok(());
        }

        let failed = report.failures.len();
        let detail = report.failures[0].error.clone();
        match self.config.replication {
            ReplicationPolicy::BestEffort => {
                warn!(op = %forward, failed, %detail, "replication failed, keeping local edit");
                Ok(())
            }
            ReplicationPolicy::Rollback => {
                warn!(op = %forward, failed, %detail, "replication failed, rolling back");
                self.roll_back(revert)?;
                Err(KvError::Replication { failed, detail })
            }
        }
    }

    /// Undo the edit just committed.
    fn roll_back(&mut self, revert: Option<Operation>) -> KvResult<()> {
        if let Some(versions) = self.versions.as_mut() {
            let conn = &mut self.conn;
            let cipher = self.cipher.as_deref();
            if versions.revert_latest(|op| apply_local(&mut *conn, cipher, op))? {
                return Ok(());
            }
        }
        match revert {
            Some(op) => apply_local(&mut self.conn, self.cipher.as_deref(), &op),
            None => Ok(()),
        }
    }

    fn report(&self, op: &str, result: KvResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(storage = %self.id, op, error = %e, "write failed");
                false
            }
        }
    }

    pub fn try_set(&mut self, key: &str, value: Value) -> KvResult<()> {
        self.try_commit(Operation::Set(key.to_string(), value))
    }

    pub fn try_delete(&mut self, key: &str) -> KvResult<()> {
        self.try_commit(Operation::Delete(key.to_string()))
    }

    pub fn try_clean(&mut self) -> KvResult<()> {
        self.try_commit(Operation::Clean)
    }

    pub fn try_load(&mut self, path: impl AsRef<Path>) -> KvResult<()> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.try_commit(Operation::Load(path))
    }

    pub fn try_loads(&mut self, json: &str) -> KvResult<()> {
        self.try_commit(Operation::Loads(json.to_string()))
    }

    pub fn set(&mut self, key: &str, value: Value) -> bool {
        let result = self.try_set(key, value);
        self.report("set", result)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let result = self.try_delete(key);
        self.report("delete", result)
    }

    /// Remove every key.
    pub fn clean(&mut self) -> bool {
        let result = self.try_clean();
        self.report("clean", result)
    }

    /// Replace the store with the snapshot file at `path`.
    pub fn load(&mut self, path: impl AsRef<Path>) -> bool {
        let result = self.try_load(path);
        self.report("load", result)
    }

    /// Replace the store with a snapshot string.
    pub fn loads(&mut self, json: &str) -> bool {
        let result = self.try_loads(json);
        self.report("loads", result)
    }

    // ---- read path ----

    pub fn try_get(&self, key: &str) -> KvResult<Option<Value>> {
        let Some(value) = self.conn.get(key)? else {
            return Ok(None);
        };
        match (self.cipher.as_deref(), envelope(&value)) {
            (Some(cipher), Some(sealed)) => {
                let plain = cipher.decrypt_string(sealed)?;
                Ok(Some(serde_json::from_str(&plain)?))
            }
            _ => Ok(Some(value)),
        }
    }

    pub fn try_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.conn.keys(pattern)
    }

    /// Every key with its decrypted value as one JSON object string.
    ///
    /// A key whose value cannot be read or decrypted is logged and left out;
    /// it does not spoil the rest of the snapshot.
    pub fn try_dumps(&self) -> KvResult<String> {
        let mut map = Map::new();
        for key in self.try_keys("*")? {
            match self.try_get(&key) {
                Ok(Some(value)) => {
                    map.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(storage = %self.id, key = %key, error = %e, "key left out of snapshot");
                }
            }
        }
        Ok(Value::Object(map).to_string())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.conn.exists(key).unwrap_or_else(|e| {
            error!(storage = %self.id, key, error = %e, "exists failed");
            false
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.try_get(key).unwrap_or_else(|e| {
            error!(storage = %self.id, key, error = %e, "get failed");
            None
        })
    }

    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.try_keys(pattern).unwrap_or_else(|e| {
            error!(storage = %self.id, pattern, error = %e, "keys failed");
            Vec::new()
        })
    }

    pub fn dumps(&self) -> String {
        self.try_dumps().unwrap_or_else(|e| {
            error!(storage = %self.id, error = %e, "dumps failed");
            "{}".to_string()
        })
    }

    /// Write `dumps()` to a file.
    pub fn dump(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let result = self
            .try_dumps()
            .and_then(|json| {
                std::fs::write(path, json).map_err(|e| KvError::from(e).with_path(path))
            });
        self.report("dump", result)
    }

    /// Estimated footprint of the connection, deep or top-level only.
    pub fn bytes_used(&self, deep: bool) -> usize {
        self.conn.measure(deep).unwrap_or_else(|e| {
            error!(storage = %self.id, error = %e, "measure failed");
            0
        })
    }

    pub fn bytes_used_human(&self, deep: bool) -> String {
        crate::size::humanize_bytes(self.bytes_used(deep))
    }

    /// Exempt `key` from eviction on the connection.
    pub fn pin(&mut self, key: &str) {
        self.conn.pin(key);
    }

    pub fn unpin(&mut self, key: &str) {
        self.conn.unpin(key);
    }

    // ---- versions ----

    /// Undo the current edit. Returns whether anything was undone.
    pub fn revert_one_operation(&mut self) -> bool {
        let Some(versions) = self.versions.as_mut() else {
            return false;
        };
        let conn = &mut self.conn;
        let cipher = self.cipher.as_deref();
        versions
            .revert_one_operation(|op| apply_local(&mut *conn, cipher, op))
            .unwrap_or_else(|e| {
                error!(error = %e, "undo failed");
                false
            })
    }

    /// Redo the next edit. Returns whether anything was redone.
    pub fn forward_one_operation(&mut self) -> bool {
        let Some(versions) = self.versions.as_mut() else {
            return false;
        };
        let conn = &mut self.conn;
        let cipher = self.cipher.as_deref();
        versions
            .forward_one_operation(|op| apply_local(&mut *conn, cipher, op))
            .unwrap_or_else(|e| {
                error!(error = %e, "redo failed");
                false
            })
    }

    /// Undo or redo until the store is at version `id`.
    pub fn local_to_version(&mut self, id: &str) -> KvResult<()> {
        let versions = self
            .versions
            .as_mut()
            .ok_or_else(|| KvError::UnknownVersion(id.to_string()))?;
        let conn = &mut self.conn;
        let cipher = self.cipher.as_deref();
        versions.to_version(id, |op| apply_local(&mut *conn, cipher, op))
    }

    pub fn get_current_version(&self) -> Option<String> {
        self.versions
            .as_ref()
            .and_then(|v| v.get_current_version())
            .map(str::to_string)
    }

    pub fn get_versions(&self) -> Vec<String> {
        match &self.versions {
            Some(versions) => versions.get_versions().unwrap_or_else(|e| {
                error!(error = %e, "version list unreadable");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    pub fn version_controller(&self) -> Option<&VersionController> {
        self.versions.as_ref()
    }

    // ---- events and slaves ----

    pub fn set_event<F>(&mut self, name: &str, callback: F, id: Option<&str>) -> KvResult<String>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.events.set_event(name, callback, id)
    }

    pub fn delete_event(&mut self, id: &str) -> KvResult<usize> {
        self.events.delete_event(id)
    }

    pub fn dispatch_event(&mut self, name: &str, payload: &Value) -> KvResult<DispatchReport> {
        self.events.dispatch_event(name, payload)
    }

    /// Registration keys of every listener.
    pub fn events(&self) -> KvResult<Vec<String>> {
        self.events.event_keys("*")
    }

    /// Mirror the listed edits onto `slave`. Returns the listener ids.
    pub fn add_slave(
        &mut self,
        slave: Arc<Mutex<KeyValueStorage>>,
        event_names: &[&str],
    ) -> KvResult<Vec<String>> {
        if let Some(bad) = event_names.iter().find(|n| !SLAVE_EVENTS.contains(*n)) {
            return Err(KvError::UnsupportedEvent(bad.to_string()));
        }
        let slave_id = slave.lock().id();
        let mut ids = Vec::with_capacity(event_names.len());
        for &name in event_names {
            let target = Arc::clone(&slave);
            let event = name.to_string();
            let id = self.events.set_event(
                name,
                move |payload| replay(&target, &event, payload),
                Some(&format!("{}_{}", slave_id, name)),
            )?;
            ids.push(id);
        }
        info!(master = %self.id, slave = %slave_id, events = ?event_names, "slave attached");
        Ok(ids)
    }

    /// Stop mirroring onto the slave with this id. Returns how many
    /// listeners were removed.
    pub fn delete_slave(&mut self, slave_id: Uuid) -> KvResult<usize> {
        let mut removed = 0;
        for name in SLAVE_EVENTS {
            removed += self.events.delete_event(&format!("{}_{}", slave_id, name))?;
        }
        Ok(removed)
    }

    // ---- queue ----

    pub fn message_queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn message_queue_mut(&mut self) -> &mut MessageQueue {
        &mut self.queue
    }
}

impl fmt::Debug for KeyValueStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStorage")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("encrypted", &self.cipher.is_some())
            .field("current_version", &self.get_current_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::tests::test_cipher;
    use tempfile::TempDir;

    fn storage() -> KeyValueStorage {
        KeyValueStorage::new(Config::default(), None).unwrap()
    }

    fn shared_storage(config: Config) -> Arc<Mutex<KeyValueStorage>> {
        Arc::new(Mutex::new(KeyValueStorage::new(config, None).unwrap()))
    }

    #[test]
    fn test_set_get_delete() {
        let mut s = storage();
        assert!(!s.exists("a"));
        assert!(s.set("a", json!({"x": 1})));
        assert!(s.exists("a"));
        assert_eq!(s.get("a").unwrap()["x"], 1);
        assert!(s.delete("a"));
        assert_eq!(s.get("a"), None);
        // deleting a missing key is fine
        assert!(s.delete("a"));
    }

    #[test]
    fn test_keys_glob() {
        let mut s = storage();
        s.set("user:1", json!(1));
        s.set("user:2", json!(2));
        s.set("order:1", json!(3));
        assert_eq!(s.keys("user:*"), vec!["user:1", "user:2"]);
        assert_eq!(s.keys("*").len(), 3);
    }

    #[test]
    fn test_dumps_clean_loads() {
        let mut s = storage();
        s.set("a", json!(1));
        s.set("b", json!({"nested": [1, 2]}));
        let snapshot = s.dumps();
        assert!(s.clean());
        assert_eq!(s.dumps(), "{}");
        assert!(s.loads(&snapshot));
        assert_eq!(s.dumps(), snapshot);
    }

    #[test]
    fn test_loads_rejects_garbage() {
        let mut s = storage();
        s.set("a", json!(1));
        assert!(!s.loads("not json"));
        assert!(!s.loads("[1]"));
        assert_eq!(s.get("a"), Some(json!(1)));
        // the failed edits left no history behind
        assert_eq!(s.get_versions().len(), 1);
    }

    #[test]
    fn test_failed_edit_keeps_redo_history() {
        let mut s = storage();
        s.set("a", json!(1));
        s.set("a", json!(2));
        assert!(s.revert_one_operation());
        let versions = s.get_versions();

        assert!(!s.loads("not json"));
        assert_eq!(s.get_versions(), versions);
        assert!(s.forward_one_operation());
        assert_eq!(s.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_undo_redo() {
        let mut s = storage();
        s.set("a", json!(1));
        let v1 = s.get_current_version().unwrap();
        s.set("a", json!(2));
        s.set("b", json!(3));

        assert!(s.revert_one_operation());
        assert!(!s.exists("b"));
        assert!(s.revert_one_operation());
        assert_eq!(s.get("a"), Some(json!(1)));
        assert_eq!(s.get_current_version(), Some(v1.clone()));

        assert!(s.forward_one_operation());
        assert_eq!(s.get("a"), Some(json!(2)));
        s.local_to_version(&v1).unwrap();
        assert_eq!(s.get("a"), Some(json!(1)));
        assert!(matches!(s.local_to_version("missing"), Err(KvError::UnknownVersion(_))));

        let log = s.version_controller().unwrap();
        assert_eq!(log.get_versions().unwrap(), s.get_versions());
        assert!(log.memory_usage_mb() > 0.0);
    }

    #[test]
    fn test_undo_clean_restores_everything() {
        let mut s = storage();
        s.set("a", json!(1));
        s.set("b", json!(2));
        let before = s.dumps();
        s.clean();
        assert!(s.keys("*").is_empty());
        assert!(s.revert_one_operation());
        assert_eq!(s.dumps(), before);
    }

    #[test]
    fn test_unversioned_has_no_history() {
        let mut s = KeyValueStorage::new(Config::unversioned(), None).unwrap();
        s.set("a", json!(1));
        assert!(s.get_versions().is_empty());
        assert!(s.get_current_version().is_none());
        assert!(s.version_controller().is_none());
        assert!(!s.revert_one_operation());
        assert!(s.local_to_version("x").is_err());
    }

    #[test]
    fn test_encrypted_values_at_rest() {
        let mut s = KeyValueStorage::new(Config::default(), Some(test_cipher())).unwrap();
        s.set("secret", json!({"pin": 1234}));
        assert_eq!(s.get("secret"), Some(json!({"pin": 1234})));

        let raw = s.conn.get("secret").unwrap().unwrap();
        let sealed = envelope(&raw).unwrap();
        assert!(!sealed.contains("1234"));

        let snapshot = s.dumps();
        assert_eq!(snapshot, r#"{"secret":{"pin":1234}}"#);
        s.clean();
        s.loads(&snapshot);
        assert_eq!(s.get("secret"), Some(json!({"pin": 1234})));
        assert!(envelope(&s.conn.get("secret").unwrap().unwrap()).is_some());
    }

    #[test]
    fn test_undecryptable_key_does_not_spoil_others() {
        let mut s = KeyValueStorage::new(Config::default(), Some(test_cipher())).unwrap();
        assert!(s.set("good", json!(1)));
        s.conn.set("bad", json!({"rjson": "AAAA"})).unwrap();

        assert_eq!(s.get("good"), Some(json!(1)));
        assert_eq!(s.get("bad"), None);
        assert!(matches!(s.try_get("bad"), Err(KvError::Decryption(_))));
        assert_eq!(s.dumps(), r#"{"good":1}"#);

        assert!(s.clean());
        assert!(s.keys("*").is_empty());
        // undo brings back everything that could be read
        assert!(s.revert_one_operation());
        assert_eq!(s.dumps(), r#"{"good":1}"#);
    }

    #[test]
    fn test_envelope_without_cipher_is_plain_data() {
        let mut s = storage();
        s.set("k", json!({"rjson": "abc"}));
        assert_eq!(s.get("k"), Some(json!({"rjson": "abc"})));
    }

    #[test]
    fn test_events_fire_on_writes() {
        let mut s = storage();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["set", "delete", "clean"] {
            let sink = Arc::clone(&seen);
            s.set_event(
                name,
                move |p| {
                    sink.lock().push((name, p.clone()));
                    Ok(())
                },
                None,
            )
            .unwrap();
        }
        s.set("a", json!(1));
        s.delete("a");
        s.clean();
        assert_eq!(
            *seen.lock(),
            vec![
                ("set", json!({"key": "a", "value": 1})),
                ("delete", json!({"key": "a"})),
                ("clean", json!({})),
            ]
        );
    }

    #[test]
    fn test_slave_mirrors_master() {
        let mut master = storage();
        let slave = shared_storage(Config::default());
        master.add_slave(Arc::clone(&slave), &DEFAULT_SLAVE_EVENTS).unwrap();

        master.set("a", json!(1));
        master.set("b", json!([1, 2]));
        master.delete("a");
        assert_eq!(slave.lock().dumps(), master.dumps());

        let slave_id = slave.lock().id();
        assert_eq!(master.delete_slave(slave_id).unwrap(), 2);
        master.set("c", json!(3));
        assert!(!slave.lock().exists("c"));
    }

    #[test]
    fn test_add_slave_rejects_unknown_event() {
        let mut master = storage();
        let slave = shared_storage(Config::default());
        assert!(matches!(
            master.add_slave(slave, &["set", "rename"]),
            Err(KvError::UnsupportedEvent(name)) if name == "rename"
        ));
        assert!(master.events().unwrap().is_empty());
    }

    #[test]
    fn test_refused_replication_rolls_back() {
        let mut s = storage();
        s.set("a", json!(1));
        s.set_event("set", |_| Err("slave offline".to_string()), None).unwrap();

        assert!(!s.set("a", json!(2)));
        assert!(!s.set("b", json!(3)));
        assert_eq!(s.get("a"), Some(json!(1)));
        assert!(!s.exists("b"));
        assert_eq!(s.get_versions().len(), 1);

        match s.try_set("c", json!(4)) {
            Err(KvError::Replication { failed, detail }) => {
                assert_eq!(failed, 1);
                assert_eq!(detail, "slave offline");
            }
            other => panic!("Expected replication error, got {:?}", other),
        }
    }

    #[test]
    fn test_refused_replication_rolls_back_unversioned() {
        let mut s = KeyValueStorage::new(Config::unversioned(), None).unwrap();
        s.set("a", json!(1));
        s.set_event("delete", |_| Err("no".to_string()), None).unwrap();
        assert!(!s.delete("a"));
        assert_eq!(s.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_best_effort_keeps_local_edit() {
        let mut config = Config::default();
        config.replication = ReplicationPolicy::BestEffort;
        let mut s = KeyValueStorage::new(config, None).unwrap();
        s.set_event("set", |_| Err("down".to_string()), None).unwrap();
        assert!(s.set("a", json!(1)));
        assert_eq!(s.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_dump_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let mut s = storage();
        s.set("a", json!(1));
        assert!(s.dump(&path));

        let mut other = storage();
        other.set("stale", json!(0));
        assert!(other.load(&path));
        assert_eq!(other.dumps(), s.dumps());
        assert!(!other.load(dir.path().join("missing.json")));
    }

    #[test]
    fn test_bounded_connection_evicts() {
        let mut s = KeyValueStorage::new(Config::bounded(400), None).unwrap();
        for i in 0..10 {
            s.set(&format!("k{}", i), json!("x".repeat(50)));
        }
        assert!(s.keys("*").len() < 10);
        assert!(s.exists("k9"));
        assert!(s.bytes_used(true) <= 400);
        assert!(s.bytes_used_human(true).ends_with(" B"));
    }

    #[test]
    fn test_switch_backend_adopts_keys() {
        let mut s = storage();
        s.set("old", json!(1));
        s.set_event("set", |_| Ok(()), None).unwrap();

        let mut backend = MemoryStore::new();
        backend.set("carried", json!(2)).unwrap();
        s.switch_backend(Box::new(backend)).unwrap();

        assert_eq!(s.keys("*"), vec!["carried"]);
        assert!(s.events().unwrap().is_empty());
        assert!(s.get_versions().is_empty());
    }

    #[test]
    fn test_queue_is_reachable() {
        let mut s = storage();
        s.message_queue_mut().push(json!("job"), "work").unwrap();
        assert_eq!(s.message_queue_mut().pop("work").unwrap(), Some(json!("job")));
        assert!(s.message_queue().list_queues().unwrap().contains(&"work".to_string()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.version_limit_mb = -1.0;
        assert!(matches!(
            KeyValueStorage::new(config, None),
            Err(KvError::InvalidConfig(_))
        ));
    }
}
