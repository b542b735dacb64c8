//! Byte-budgeted eviction cache over any backing store.
//!
//! Every entry is priced with the deep size estimator when it is written.
//! Once the running total passes the budget, the oldest unpinned entry in
//! recency order is evicted until the total fits again or only pinned
//! entries remain.
//!
//! LRU moves a key to the back of the order on every `set` and `get`; FIFO
//! fixes the position at first insertion.

use std::fmt;
use std::str::FromStr;

use hashbrown::HashSet;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::size::{entry_size, humanize_bytes, shallow_size, str_size};
use crate::store::BackingStore;

/// Victim selection policy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least recently set or read goes first
    #[default]
    Lru,
    /// First inserted goes first
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "fifo" => Ok(EvictionPolicy::Fifo),
            _ => Err(KvError::InvalidPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
        }
    }
}

/// Called with `(key, value)` for every evicted entry.
pub type EvictCallback = Box<dyn FnMut(&str, &Value) + Send>;

/// Per-key sizes in recency order plus their running total.
#[derive(Debug, Default)]
struct Ledger {
    entries: IndexMap<String, usize>,
    current: usize,
}

impl Ledger {
    fn forget(&mut self, key: &str) {
        if let Some(size) = self.entries.shift_remove(key) {
            self.current = self.current.saturating_sub(size);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(size) = self.entries.shift_remove(key) {
            self.entries.insert(key.to_string(), size);
        }
    }
}

/// Eviction cache wrapping a backing store.
///
/// Reads take `&self` like every store, so the ledger sits behind a mutex to
/// let `get` refresh LRU recency.
pub struct EvictionCache<S: BackingStore> {
    store: S,
    max_bytes: usize,
    policy: EvictionPolicy,
    ledger: Mutex<Ledger>,
    pinned: HashSet<String>,
    on_evict: Option<EvictCallback>,
}

impl<S: BackingStore> EvictionCache<S> {
    /// Wrap `store` with a byte budget. `max_bytes == 0` disables eviction.
    ///
    /// Keys already present in `store` are priced in their iteration order.
    pub fn new(store: S, max_bytes: usize, policy: EvictionPolicy) -> KvResult<Self> {
        let mut ledger = Ledger::default();
        for key in store.keys("*")? {
            if let Some(value) = store.get(&key)? {
                let size = entry_size(&key, &value);
                ledger.current += size;
                ledger.entries.insert(key, size);
            }
        }
        let mut cache = Self {
            store,
            max_bytes,
            policy,
            ledger: Mutex::new(ledger),
            pinned: HashSet::new(),
            on_evict: None,
        };
        cache.evict()?;
        Ok(cache)
    }

    /// Same as [`EvictionCache::new`] with the policy given by name.
    pub fn with_policy_name(store: S, max_bytes: usize, policy: &str) -> KvResult<Self> {
        Self::new(store, max_bytes, policy.parse()?)
    }

    /// Install the eviction callback.
    pub fn on_evict(mut self, callback: impl FnMut(&str, &Value) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Exempt `key` from eviction. Pinned keys still count against the budget.
    pub fn pin(&mut self, key: &str) {
        self.pinned.insert(key.to_string());
    }

    pub fn unpin(&mut self, key: &str) {
        self.pinned.remove(key);
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.pinned.contains(key)
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Running total of tracked entry sizes.
    pub fn current_bytes(&self) -> usize {
        self.ledger.lock().current
    }

    /// Tracked keys, oldest first in victim order.
    pub fn recency(&self) -> Vec<String> {
        self.ledger.lock().entries.keys().cloned().collect()
    }

    /// Footprint of the cache: the tracked deep total, or the sum of shallow
    /// sizes when `deep` is false.
    pub fn measure(&self, deep: bool) -> KvResult<usize> {
        if deep {
            return Ok(self.current_bytes());
        }
        let mut total = 0;
        for key in self.store.keys("*")? {
            if let Some(value) = self.store.get(&key)? {
                total += str_size(&key) + shallow_size(&value);
            }
        }
        Ok(total)
    }

    /// [`EvictionCache::measure`] rendered for humans.
    pub fn measure_human(&self, deep: bool) -> KvResult<String> {
        self.measure(deep).map(humanize_bytes)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn pick_victim(&self) -> Option<String> {
        let ledger = self.ledger.lock();
        ledger
            .entries
            .keys()
            .find(|k| !self.pinned.contains(k.as_str()))
            .cloned()
    }

    fn evict(&mut self) -> KvResult<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        while self.current_bytes() > self.max_bytes {
            let Some(victim) = self.pick_victim() else {
                debug!(
                    current = self.current_bytes(),
                    max = self.max_bytes,
                    "only pinned keys remain, staying over budget"
                );
                break;
            };
            let value = self.store.get(&victim)?.unwrap_or(Value::Null);
            self.ledger.lock().forget(&victim);
            self.store.delete(&victim)?;
            debug!(key = %victim, policy = %self.policy, "evicted");
            if let Some(callback) = self.on_evict.as_mut() {
                callback(&victim, &value);
            }
        }
        Ok(())
    }
}

impl<S: BackingStore> BackingStore for EvictionCache<S> {
    fn exists(&self, key: &str) -> KvResult<bool> {
        self.store.exists(key)
    }

    fn set(&mut self, key: &str, value: Value) -> KvResult<()> {
        let size = entry_size(key, &value);
        self.store.set(key, value)?;
        {
            let mut ledger = self.ledger.lock();
            let previous = match self.policy {
                EvictionPolicy::Lru => ledger.entries.shift_remove(key),
                EvictionPolicy::Fifo => ledger.entries.get(key).copied(),
            };
            if let Some(previous) = previous {
                ledger.current = ledger.current.saturating_sub(previous);
            }
            ledger.current += size;
            // FIFO keeps an existing key in place, LRU re-appends it
            ledger.entries.insert(key.to_string(), size);
        }
        self.evict()
    }

    fn get(&self, key: &str) -> KvResult<Option<Value>> {
        let value = self.store.get(key)?;
        let mut ledger = self.ledger.lock();
        match value {
            Some(_) if self.policy == EvictionPolicy::Lru => ledger.touch(key),
            Some(_) => {}
            // removed behind our back; stop charging for it
            None => ledger.forget(key),
        }
        Ok(value)
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        self.store.delete(key)?;
        self.ledger.lock().forget(key);
        Ok(())
    }

    fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.store.keys(pattern)
    }

    fn clean(&mut self) -> KvResult<()> {
        self.store.clean()?;
        let mut ledger = self.ledger.lock();
        ledger.entries.clear();
        ledger.current = 0;
        Ok(())
    }

    fn bytes_used(&self) -> KvResult<usize> {
        Ok(self.current_bytes())
    }
}
