//! layerkv records: typed objects and groups over the layerkv engine
//!
//! Records are stored one per key under `<Kind>:<uuid>`. The prefix picks
//! the decoder, so the set of record kinds is a closed enum rather than a
//! lookup by type name.
//!
//! - [`Record`]: id, rank, timestamps, status, metadata and a kind-specific body
//! - [`RecordStore`]: add/find/update/delete plus group membership
//! - [`ChildWalker`]: lazy pre-order walk yielding `(record, depth)`
//!
//! Writes go through [`layerkv_core::KeyValueStorage`], so undo/redo,
//! encryption at rest and slave replication apply to records unchanged.
//!
//! ```
//! use layerkv_records::{Record, RecordStore};
//!
//! let mut store = RecordStore::in_memory().unwrap();
//! let team = store.add(Record::group("alice")).unwrap();
//! let doc = store.add_child(&team, Record::object().with_status("draft")).unwrap();
//!
//! assert_eq!(store.children(&team).unwrap()[0].id, doc);
//! assert_eq!(store.delete(&team).unwrap(), 2);
//! ```

pub mod error;
pub mod kinds;
pub mod record;
pub mod store;
pub mod walker;

pub use error::{RecordError, RecordResult};
pub use kinds::RecordKind;
pub use record::{GroupBody, Record, RecordBody};
pub use store::RecordStore;
pub use walker::ChildWalker;
