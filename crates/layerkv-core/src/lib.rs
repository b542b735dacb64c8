//! layerkv core: a layered key-value storage engine
//!
//! An embeddable key-value engine built in layers over a pluggable flat
//! backing store. Everything above the store is itself kept in a store, so
//! every layer composes through the same five-method contract.
//!
//! # Architecture
//!
//! - **Backing store**: `exists/set/get/delete/keys(glob)` plus generic bulk helpers
//! - **Eviction cache**: byte budget with LRU or FIFO victims; pinned keys stay
//! - **Event dispatcher**: subscriptions are store entries, publishing is a glob
//! - **Message queue**: FIFO queues as head/tail counters plus slot entries
//! - **Version log**: undo/redo of `(forward, revert)` operation pairs
//! - **Chunked cipher**: unpadded block RSA for values at rest
//! - **Storage facade**: one write path that logs, applies, replicates and
//!   rolls back when a slave refuses
//!
//! # Example
//!
//! ```
//! use layerkv_core::{Config, KeyValueStorage};
//! use serde_json::json;
//!
//! let mut store = KeyValueStorage::new(Config::default(), None).unwrap();
//! store.set("greeting", json!({"text": "hello"}));
//! store.set("greeting", json!({"text": "bye"}));
//!
//! assert!(store.revert_one_operation());
//! assert_eq!(store.get("greeting").unwrap()["text"], "hello");
//! assert!(store.forward_one_operation());
//! assert_eq!(store.get("greeting").unwrap()["text"], "bye");
//! ```

pub mod cipher;
pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod queue;
pub mod size;
pub mod storage;
pub mod store;
pub mod version;

// Re-export key types for convenience
pub use cipher::{ChunkCipher, RsaKey};
pub use config::{Config, ReplicationPolicy};
pub use error::{KvError, KvResult};
pub use events::{DispatchReport, EventDispatcher, Listener, ListenerFailure};
pub use eviction::{EvictionCache, EvictionPolicy};
pub use queue::{MessageQueue, QueueEvent};
pub use size::{deep_size, humanize_bytes, shallow_size};
pub use storage::{Connection, KeyValueStorage};
pub use store::{shared, BackingStore, MemoryStore, SharedStore};
pub use version::{Operation, OperationRecord, VersionController};
