//! `RecordStore`: typed records over the storage facade.
//!
//! Every record is one key. Group membership is kept in the group's
//! `children_id` list, so each structural edit is a handful of plain `set`s
//! and `delete`s that the facade versions and replicates like any other write.

use layerkv_core::{Config, KeyValueStorage};
use tracing::{debug, warn};

use crate::error::{RecordError, RecordResult};
use crate::kinds::RecordKind;
use crate::record::Record;
use crate::walker::ChildWalker;

pub struct RecordStore {
    storage: KeyValueStorage,
}

impl RecordStore {
    pub fn new(storage: KeyValueStorage) -> Self {
        Self { storage }
    }

    /// Store over a fresh unencrypted, versioned in-memory facade.
    pub fn in_memory() -> RecordResult<Self> {
        Ok(Self::new(KeyValueStorage::new(Config::default(), None)?))
    }

    pub fn storage(&self) -> &KeyValueStorage {
        &self.storage
    }

    /// Direct access for undo/redo, slaves and snapshots.
    pub fn storage_mut(&mut self) -> &mut KeyValueStorage {
        &mut self.storage
    }

    pub fn into_inner(self) -> KeyValueStorage {
        self.storage
    }

    fn save(&mut self, record: &Record) -> RecordResult<()> {
        let value = record.to_value()?;
        self.storage.try_set(&record.id, value)?;
        Ok(())
    }

    fn require(&self, id: &str) -> RecordResult<Record> {
        self.find(id)?.ok_or_else(|| RecordError::NotFound(id.to_string()))
    }

    fn require_group(&self, id: &str) -> RecordResult<Record> {
        let record = self.require(id)?;
        if record.kind() != RecordKind::Group {
            return Err(RecordError::WrongKind {
                id: id.to_string(),
                expected: RecordKind::Group,
                actual: record.kind(),
            });
        }
        Ok(record)
    }

    /// Store a new record. Fails if its id is already taken.
    pub fn add(&mut self, record: Record) -> RecordResult<String> {
        RecordKind::from_id(&record.id)?;
        if self.storage.try_get(&record.id)?.is_some() {
            return Err(RecordError::AlreadyExists(record.id));
        }
        self.save(&record)?;
        debug!(id = %record.id, "record added");
        Ok(record.id)
    }

    pub fn find(&self, id: &str) -> RecordResult<Option<Record>> {
        RecordKind::from_id(id)?;
        match self.storage.try_get(id)? {
            Some(value) => Record::from_value(id, value).map(Some),
            None => Ok(None),
        }
    }

    /// Every stored record of `kind`, in key order. Keys under the kind's
    /// prefix that are not valid record ids are skipped.
    pub fn find_all(&self, kind: RecordKind) -> RecordResult<Vec<Record>> {
        let mut records = Vec::new();
        for key in self.storage.try_keys(&kind.pattern())? {
            if RecordKind::from_id(&key).is_err() {
                debug!(key = %key, "skipping non-record key");
                continue;
            }
            if let Some(record) = self.find(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Edit a record in place and store it with a fresh `update_time`.
    /// The id and the kind cannot change.
    pub fn update<F>(&mut self, id: &str, edit: F) -> RecordResult<Record>
    where
        F: FnOnce(&mut Record),
    {
        let mut record = self.require(id)?;
        let kind = record.kind();
        edit(&mut record);
        if record.id != id {
            return Err(RecordError::IdChanged {
                from: id.to_string(),
                to: record.id,
            });
        }
        if record.kind() != kind {
            return Err(RecordError::WrongKind {
                id: id.to_string(),
                expected: kind,
                actual: record.kind(),
            });
        }
        record.touch();
        self.save(&record)?;
        Ok(record)
    }

    /// `status` sets the status; every other property goes to metadata.
    pub fn update_properties<I, K, V>(&mut self, id: &str, properties: I) -> RecordResult<Record>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.update(id, |record| record.apply_properties(properties))
    }

    /// Delete a record. A group takes its whole subtree with it. The record is
    /// also unlinked from the group that lists it. Returns the number of
    /// records removed.
    pub fn delete(&mut self, id: &str) -> RecordResult<usize> {
        let record = self.require(id)?;
        self.unlink(&record)?;

        let mut doomed = vec![record.id.clone()];
        doomed.extend(ChildWalker::new(self, &record).map(|(child, _)| child.id));
        // leaves first so an interrupted delete never orphans a subtree
        for key in doomed.iter().rev() {
            self.storage.try_delete(key)?;
        }
        debug!(id = %id, removed = doomed.len(), "record deleted");
        Ok(doomed.len())
    }

    fn unlink(&mut self, record: &Record) -> RecordResult<()> {
        let parents = match record.group_body().and_then(|g| g.parent_id.clone()) {
            Some(parent_id) => self.find(&parent_id)?.into_iter().collect(),
            // objects do not know their group; look for it
            None => self
                .find_all(RecordKind::Group)?
                .into_iter()
                .filter(|g| g.children_id().contains(&record.id))
                .collect::<Vec<_>>(),
        };
        for parent in parents {
            self.update(&parent.id, |p| {
                if let Some(body) = p.group_body_mut() {
                    body.children_id.retain(|c| c != &record.id);
                }
            })?;
        }
        Ok(())
    }

    /// Store `child` as a new record listed under the group `parent_id`.
    pub fn add_child(&mut self, parent_id: &str, mut child: Record) -> RecordResult<String> {
        let parent = self.require_group(parent_id)?;
        if let Some(body) = child.group_body_mut() {
            body.parent_id = Some(parent.id.clone());
        }
        let child_id = self.add(child)?;
        self.update(&parent.id, |p| {
            if let Some(body) = p.group_body_mut() {
                body.children_id.push(child_id.clone());
            }
        })?;
        Ok(child_id)
    }

    /// Delete `child_id`, and its subtree, from the group `parent_id`.
    pub fn remove_child(&mut self, parent_id: &str, child_id: &str) -> RecordResult<usize> {
        let parent = self.require_group(parent_id)?;
        if !parent.children_id().iter().any(|c| c == child_id) {
            return Err(RecordError::NotFound(format!("{} in {}", child_id, parent_id)));
        }
        if self.find(child_id)?.is_none() {
            // dangling entry; only the list needs fixing
            self.update(parent_id, |p| {
                if let Some(body) = p.group_body_mut() {
                    body.children_id.retain(|c| c != child_id);
                }
            })?;
            return Ok(0);
        }
        self.delete(child_id)
    }

    /// Direct children of a group in list order. Ids that no longer resolve
    /// are skipped.
    pub fn children(&self, id: &str) -> RecordResult<Vec<Record>> {
        let parent = self.require_group(id)?;
        let mut children = Vec::with_capacity(parent.children_id().len());
        for child_id in parent.children_id() {
            match self.find(child_id)? {
                Some(child) => children.push(child),
                None => warn!(parent = %id, child = %child_id, "dangling child id"),
            }
        }
        Ok(children)
    }

    /// Every transitive child of `id` with its depth (direct children are 1).
    pub fn walk(&self, id: &str) -> RecordResult<ChildWalker<'_>> {
        let root = self.require(id)?;
        Ok(ChildWalker::new(self, &root))
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("storage", &self.storage.id())
            .finish()
    }
}
