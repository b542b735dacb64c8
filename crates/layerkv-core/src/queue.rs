//! FIFO message queues hosted on a key-value store.
//!
//! A queue is a descriptor `{head, tail}` under `_MessageQueue:<name>` and one
//! entry per message under `_MessageQueue:<name>:<slot>`, with the name
//! base64url-encoded. Slots in `[head, tail)` are live or holes; holes appear
//! when a slot is deleted or evicted from under the queue and are skipped on
//! the next read.
//!
//! The queue shares one store with its event dispatcher, so queue entries
//! obey that store's byte budget like anything else in it. Pin the keys or
//! use an unbounded cache when messages must not be lost.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::KvResult;
use crate::events::{decode_name, encode_name, EventDispatcher};
use crate::eviction::{EvictionCache, EvictionPolicy};
use crate::store::{shared, BackingStore, MemoryStore, SharedStore};

/// Notifications a queue publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Pushed,
    Popped,
    Empty,
    Cleared,
}

impl QueueEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEvent::Pushed => "pushed",
            QueueEvent::Popped => "popped",
            QueueEvent::Empty => "empty",
            QueueEvent::Cleared => "cleared",
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Head/tail counters persisted for each queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub head: u64,
    pub tail: u64,
}

impl QueueDescriptor {
    pub fn len(&self) -> u64 {
        self.tail.saturating_sub(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MessageQueue {
    store: SharedStore,
    dispatcher: EventDispatcher,
}

impl MessageQueue {
    pub const ROOT_KEY: &'static str = "_MessageQueue";
    pub const ROOT_KEY_EVENT: &'static str = "MQE";
    pub const DEFAULT_QUEUE: &'static str = "default";

    /// Queue whose messages and listeners share `store`.
    pub fn new(store: SharedStore) -> Self {
        let dispatcher = EventDispatcher::new(store.clone());
        Self { store, dispatcher }
    }

    /// Queue over a fresh in-process cache with the given budget.
    pub fn in_memory(max_bytes: usize, policy: EvictionPolicy) -> KvResult<Self> {
        let cache = EvictionCache::new(MemoryStore::new(), max_bytes, policy)?;
        Ok(Self::new(shared(cache)))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn descriptor_key(queue: &str) -> String {
        format!("{}:{}", Self::ROOT_KEY, encode_name(queue))
    }

    fn slot_key(queue: &str, slot: u64) -> String {
        format!("{}:{}:{}", Self::ROOT_KEY, encode_name(queue), slot)
    }

    fn event_name(queue: &str, event: QueueEvent) -> String {
        format!("{}:{}:{}", Self::ROOT_KEY_EVENT, encode_name(queue), event)
    }

    fn load_descriptor(&self, queue: &str) -> KvResult<QueueDescriptor> {
        let raw = self.store.lock().get(&Self::descriptor_key(queue))?;
        Ok(match raw {
            Some(v) => serde_json::from_value(v).unwrap_or_else(|e| {
                warn!(queue = %queue, error = %e, "unreadable queue descriptor, starting over");
                QueueDescriptor::default()
            }),
            None => QueueDescriptor::default(),
        })
    }

    fn save_descriptor(&self, queue: &str, descriptor: QueueDescriptor) -> KvResult<()> {
        self.store
            .lock()
            .set(&Self::descriptor_key(queue), serde_json::to_value(descriptor)?)
    }

    fn notify(&mut self, queue: &str, event: QueueEvent, payload: &Value) -> KvResult<()> {
        self.dispatcher
            .dispatch_event(&Self::event_name(queue, event), payload)
            .map(|_| ())
    }

    /// Advance `head` over holes. Persists the descriptor when it moved.
    fn skip_holes(
        &self,
        queue: &str,
        mut descriptor: QueueDescriptor,
    ) -> KvResult<QueueDescriptor> {
        let start = descriptor.head;
        {
            let store = self.store.lock();
            while descriptor.head < descriptor.tail
                && !store.exists(&Self::slot_key(queue, descriptor.head))?
            {
                descriptor.head += 1;
            }
        }
        if descriptor.head != start {
            self.save_descriptor(queue, descriptor)?;
        }
        Ok(descriptor)
    }

    /// Append `message` to `queue`. Returns the slot key it was written to.
    pub fn push(&mut self, message: Value, queue: &str) -> KvResult<String> {
        let mut descriptor = self.load_descriptor(queue)?;
        let key = Self::slot_key(queue, descriptor.tail);
        self.store.lock().set(&key, message.clone())?;
        descriptor.tail += 1;
        self.save_descriptor(queue, descriptor)?;
        self.notify(queue, QueueEvent::Pushed, &message)?;
        Ok(key)
    }

    /// Read the oldest live message, removing it unless `peek`.
    pub fn pop_item(
        &mut self,
        queue: &str,
        peek: bool,
    ) -> KvResult<(Option<String>, Option<Value>)> {
        let mut descriptor = self.skip_holes(queue, self.load_descriptor(queue)?)?;
        if descriptor.is_empty() {
            return Ok((None, None));
        }

        let key = Self::slot_key(queue, descriptor.head);
        let Some(message) = self.store.lock().get(&key)? else {
            return Ok((None, None));
        };
        if peek {
            return Ok((Some(key), Some(message)));
        }

        self.store.lock().delete(&key)?;
        descriptor.head += 1;
        self.save_descriptor(queue, descriptor)?;
        self.notify(queue, QueueEvent::Popped, &message)?;
        if self.skip_holes(queue, descriptor)?.is_empty() {
            self.notify(queue, QueueEvent::Empty, &Value::Null)?;
        }
        Ok((Some(key), Some(message)))
    }

    pub fn pop(&mut self, queue: &str) -> KvResult<Option<Value>> {
        Ok(self.pop_item(queue, false)?.1)
    }

    pub fn peek(&mut self, queue: &str) -> KvResult<Option<Value>> {
        Ok(self.pop_item(queue, true)?.1)
    }

    /// Live messages in `queue`, after skipping leading holes.
    pub fn queue_size(&mut self, queue: &str) -> KvResult<u64> {
        let descriptor = self.skip_holes(queue, self.load_descriptor(queue)?)?;
        Ok(descriptor.len())
    }

    /// Drop every message and the descriptor of `queue`.
    pub fn clear(&mut self, queue: &str) -> KvResult<()> {
        {
            let mut store = self.store.lock();
            let slots = format!("{}:{}:*", Self::ROOT_KEY, encode_name(queue));
            for key in store.keys(&slots)? {
                store.delete(&key)?;
            }
            store.delete(&Self::descriptor_key(queue))?;
        }
        self.notify(queue, QueueEvent::Cleared, &json!({}))
    }

    /// Subscribe to `event` on `queue`. Returns the listener id.
    pub fn add_listener<F>(
        &mut self,
        queue: &str,
        event: QueueEvent,
        callback: F,
        listener_id: Option<&str>,
    ) -> KvResult<String>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.dispatcher
            .set_event(&Self::event_name(queue, event), callback, listener_id)
    }

    /// Unsubscribe a listener id from every queue event. Returns how many.
    pub fn remove_listener(&mut self, listener_id: &str) -> KvResult<usize> {
        self.dispatcher.delete_event(listener_id)
    }

    /// Registration keys of the listeners on `queue`.
    pub fn list_listeners(&self, queue: &str) -> KvResult<Vec<String>> {
        let mut keys = Vec::new();
        for event in [
            QueueEvent::Pushed,
            QueueEvent::Popped,
            QueueEvent::Empty,
            QueueEvent::Cleared,
        ] {
            keys.extend(self.dispatcher.event_keys(&Self::event_name(queue, event))?);
        }
        Ok(keys)
    }

    /// Names of every queue that has a descriptor.
    pub fn list_queues(&self) -> KvResult<Vec<String>> {
        let prefix = format!("{}:", Self::ROOT_KEY);
        let keys = self.store.lock().keys(&format!("{}*", prefix))?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains(':'))
            .filter_map(decode_name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn queue() -> MessageQueue {
        MessageQueue::in_memory(0, EvictionPolicy::Lru).unwrap()
    }

    #[test]
    fn test_fifo_order_and_size() {
        let mut mq = queue();
        mq.push(json!({"n": 1}), "q").unwrap();
        mq.push(json!({"n": 2}), "q").unwrap();
        mq.push(json!({"n": 3}), "q").unwrap();
        assert_eq!(mq.queue_size("q").unwrap(), 3);

        assert_eq!(mq.pop("q").unwrap(), Some(json!({"n": 1})));
        assert_eq!(mq.pop("q").unwrap(), Some(json!({"n": 2})));
        assert_eq!(mq.pop("q").unwrap(), Some(json!({"n": 3})));
        assert_eq!(mq.pop("q").unwrap(), None);
        assert_eq!(mq.queue_size("q").unwrap(), 0);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut mq = queue();
        let key = mq.push(json!({"a": 1}), "default").unwrap();
        let (peeked_key, peeked) = mq.pop_item("default", true).unwrap();
        assert_eq!(peeked_key, Some(key));
        assert_eq!(peeked, Some(json!({"a": 1})));
        assert_eq!(mq.queue_size("default").unwrap(), 1);
        assert_eq!(mq.peek("default").unwrap(), Some(json!({"a": 1})));
        assert_eq!(mq.pop("default").unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_holes_are_skipped() {
        let mut mq = queue();
        let first = mq.push(json!(1), "q").unwrap();
        let second = mq.push(json!(2), "q").unwrap();
        mq.push(json!(3), "q").unwrap();
        mq.store().lock().delete(&first).unwrap();
        mq.store().lock().delete(&second).unwrap();

        assert_eq!(mq.queue_size("q").unwrap(), 1);
        assert_eq!(mq.pop("q").unwrap(), Some(json!(3)));
        assert_eq!(mq.pop("q").unwrap(), None);
    }

    #[test]
    fn test_clear_resets_queue() {
        let mut mq = queue();
        mq.push(json!({"x": 1}), "q").unwrap();
        mq.push(json!({"y": 2}), "q").unwrap();
        mq.clear("q").unwrap();
        assert_eq!(mq.queue_size("q").unwrap(), 0);
        assert_eq!(mq.pop("q").unwrap(), None);
        assert!(mq.list_queues().unwrap().is_empty());
    }

    #[test]
    fn test_events_fire_in_order() {
        let mut mq = queue();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        for event in [
            QueueEvent::Pushed,
            QueueEvent::Popped,
            QueueEvent::Empty,
            QueueEvent::Cleared,
        ] {
            let sink = Arc::clone(&seen);
            mq.add_listener(
                "default",
                event,
                move |_| {
                    sink.lock().push(event.as_str());
                    Ok(())
                },
                None,
            )
            .unwrap();
        }

        mq.push(json!({"m": 1}), "default").unwrap();
        mq.push(json!({"m": 2}), "default").unwrap();
        assert_eq!(mq.pop("default").unwrap(), Some(json!({"m": 1})));
        assert_eq!(mq.pop("default").unwrap(), Some(json!({"m": 2})));
        mq.clear("default").unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["pushed", "pushed", "popped", "popped", "empty", "cleared"]
        );
    }

    #[test]
    fn test_listeners_are_per_queue() {
        let mut mq = queue();
        let id = mq
            .add_listener("q1", QueueEvent::Pushed, |_| Ok(()), Some("watcher"))
            .unwrap();
        mq.add_listener("q1", QueueEvent::Empty, |_| Ok(()), Some("watcher"))
            .unwrap();
        assert_eq!(mq.list_listeners("q1").unwrap().len(), 2);
        assert!(mq.list_listeners("q2").unwrap().is_empty());
        assert_eq!(mq.remove_listener(&id).unwrap(), 2);
        assert!(mq.list_listeners("q1").unwrap().is_empty());
    }

    #[test]
    fn test_queues_are_isolated() {
        let mut mq = queue();
        mq.push(json!({"a": 1}), "q1").unwrap();
        mq.push(json!({"b": 2}), "q2").unwrap();
        assert_eq!(mq.queue_size("q1").unwrap(), 1);
        assert_eq!(mq.queue_size("q2").unwrap(), 1);
        assert_eq!(mq.pop("q1").unwrap(), Some(json!({"a": 1})));
        assert_eq!(mq.queue_size("q2").unwrap(), 1);

        let mut names = mq.list_queues().unwrap();
        names.sort();
        assert_eq!(names, vec!["q1", "q2"]);
    }

    #[test]
    fn test_queue_names_with_separators() {
        let mut mq = queue();
        mq.push(json!(1), "jobs:high").unwrap();
        mq.push(json!(2), "jobs").unwrap();
        assert_eq!(mq.pop("jobs").unwrap(), Some(json!(2)));
        assert_eq!(mq.pop("jobs:high").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_bounded_queue_loses_oldest_messages() {
        // LRU keeps the descriptor alive, since every push rewrites it
        let mut mq = MessageQueue::in_memory(1_200, EvictionPolicy::Lru).unwrap();
        for i in 0..20 {
            mq.push(json!({"i": i}), "q").unwrap();
        }
        // early slots were evicted; the survivors still come out in order
        let mut last = -1;
        while let Some(v) = mq.pop("q").unwrap() {
            let i = v["i"].as_i64().unwrap();
            assert!(i > last);
            last = i;
        }
        assert_eq!(last, 19);
    }
}
