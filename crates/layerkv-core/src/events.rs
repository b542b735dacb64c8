//! Publish/subscribe dispatch hosted on a key-value store.
//!
//! A registration is an ordinary store entry under
//! `_Event:<base64url(event name)>:<listener id>`, so subscribing is a `set`,
//! unsubscribing is a `delete` and publishing is a glob over `keys`. The
//! callable itself cannot live in a JSON store; it sits in a side table keyed
//! by the same string and is dropped once its registration disappears,
//! whether deleted or evicted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hashbrown::HashMap;
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::KvResult;
use crate::eviction::{EvictionCache, EvictionPolicy};
use crate::store::{shared, BackingStore, MemoryStore, SharedStore};

/// Listener callback. An `Err` marks the delivery as failed without
/// stopping the dispatch.
pub type Listener = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Encode a name so it can sit between `:` separators.
pub fn encode_name(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name.as_bytes())
}

/// Reverse of [`encode_name`]; `None` if `encoded` is not one of ours.
pub fn decode_name(encoded: &str) -> Option<String> {
    URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// One listener that refused or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    /// Registration key of the listener
    pub key: String,
    /// Error returned (or panic message)
    pub error: String,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that were called
    pub invoked: usize,
    /// Listeners that refused the event with an `Err`, in call order
    pub failures: Vec<ListenerFailure>,
    /// Listeners that panicked. Logged only; a panic is a listener bug,
    /// not a refusal.
    pub panics: Vec<ListenerFailure>,
}

impl DispatchReport {
    /// No listener refused the event. Panics do not count.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct EventDispatcher {
    store: SharedStore,
    listeners: HashMap<String, Listener>,
}

impl EventDispatcher {
    pub const ROOT_KEY: &'static str = "_Event";

    /// Dispatcher whose registrations live in `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            listeners: HashMap::new(),
        }
    }

    /// Dispatcher over a private unbounded cache.
    pub fn in_memory() -> KvResult<Self> {
        let cache = EvictionCache::new(MemoryStore::new(), 0, EvictionPolicy::Lru)?;
        Ok(Self::new(shared(cache)))
    }

    /// The store registrations are kept in.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn event_key(name: &str, id: &str) -> String {
        let name = if name == "*" {
            "*".to_string()
        } else {
            encode_name(name)
        };
        format!("{}:{}:{}", Self::ROOT_KEY, name, id)
    }

    /// Register `callback` under `name`. Returns the listener id, a fresh
    /// uuid unless one is given. Re-using an id for the same name replaces
    /// the previous callback.
    pub fn set_event<F>(&mut self, name: &str, callback: F, id: Option<&str>) -> KvResult<String>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = Self::event_key(name, &id);
        self.store
            .lock()
            .set(&key, json!({"event": name, "id": id}))?;
        self.listeners.insert(key, Arc::new(callback));
        Ok(id)
    }

    /// Callbacks registered under listener `id`, across all event names.
    pub fn get_event(&self, id: &str) -> KvResult<Vec<Listener>> {
        let keys = self.store.lock().keys(&Self::event_key("*", id))?;
        Ok(keys
            .iter()
            .filter_map(|k| self.listeners.get(k).cloned())
            .collect())
    }

    /// Remove every registration with listener `id`. Returns how many.
    pub fn delete_event(&mut self, id: &str) -> KvResult<usize> {
        let mut store = self.store.lock();
        let keys = store.keys(&Self::event_key("*", id))?;
        for key in &keys {
            store.delete(key)?;
            self.listeners.remove(key);
        }
        Ok(keys.len())
    }

    /// Registration keys for `name` (`"*"` for all), in store order.
    pub fn event_keys(&self, name: &str) -> KvResult<Vec<String>> {
        self.store.lock().keys(&Self::event_key(name, "*"))
    }

    /// Every live registration with its callback.
    pub fn events(&self) -> KvResult<Vec<(String, Listener)>> {
        Ok(self
            .event_keys("*")?
            .into_iter()
            .filter_map(|k| self.listeners.get(&k).cloned().map(|l| (k, l)))
            .collect())
    }

    /// Call every listener registered under `name` with `payload`.
    ///
    /// Each listener runs even if an earlier one returned an error or
    /// panicked. Refusals and panics are reported separately. The store
    /// lock is released before any listener runs.
    pub fn dispatch_event(&mut self, name: &str, payload: &Value) -> KvResult<DispatchReport> {
        let keys = self.event_keys(name)?;
        let prefix = Self::event_key(name, "");
        self.listeners
            .retain(|k, _| !k.starts_with(&prefix) || keys.contains(k));

        let targets: Vec<(String, Listener)> = keys
            .into_iter()
            .filter_map(|k| self.listeners.get(&k).cloned().map(|l| (k, l)))
            .collect();

        let mut report = DispatchReport::default();
        for (key, listener) in targets {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(event = %name, listener = %key, %error, "listener refused event");
                    report.failures.push(ListenerFailure { key, error });
                }
                Err(panic) => {
                    let error = panic_message(panic.as_ref());
                    error!(event = %name, listener = %key, %error, "listener panicked");
                    report.panics.push(ListenerFailure { key, error });
                }
            }
        }
        Ok(report)
    }

    /// Drop every registration.
    pub fn clean(&mut self) -> KvResult<()> {
        let mut store = self.store.lock();
        for key in store.keys(&Self::event_key("*", "*"))? {
            store.delete(&key)?;
        }
        self.listeners.clear();
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {}", s)
    } else {
        "listener panicked".to_string()
    }
}
