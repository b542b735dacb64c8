//! Depth-first walk over a group's transitive children.

use std::collections::HashSet;

use tracing::warn;

use crate::record::Record;
use crate::store::RecordStore;

/// Yields `(record, depth)` in pre-order, direct children at depth 1.
///
/// Pending ids sit on an explicit stack, so depth is limited only by memory.
/// Each id is visited at most once, which keeps the walk finite even over a
/// hand-edited store whose groups list each other. Ids that no longer resolve
/// are skipped.
pub struct ChildWalker<'a> {
    store: &'a RecordStore,
    stack: Vec<(String, usize)>,
    seen: HashSet<String>,
}

impl<'a> ChildWalker<'a> {
    pub fn new(store: &'a RecordStore, root: &Record) -> Self {
        let mut walker = Self {
            store,
            stack: Vec::new(),
            seen: HashSet::from([root.id.clone()]),
        };
        walker.push_children(root, 1);
        walker
    }

    fn push_children(&mut self, record: &Record, depth: usize) {
        // reversed so the first child is popped first
        for id in record.children_id().iter().rev() {
            self.stack.push((id.clone(), depth));
        }
    }
}

impl Iterator for ChildWalker<'_> {
    type Item = (Record, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((id, depth)) = self.stack.pop() {
            if !self.seen.insert(id.clone()) {
                continue;
            }
            match self.store.find(&id) {
                Ok(Some(record)) => {
                    self.push_children(&record, depth + 1);
                    return Some((record, depth));
                }
                Ok(None) => {}
                Err(e) => warn!(id = %id, error = %e, "skipping unreadable child"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::RecordKind;

    #[test]
    fn test_preorder_with_depths() {
        let mut s = RecordStore::in_memory().unwrap();
        let root = s.add(Record::group("a")).unwrap();
        let a = s.add_child(&root, Record::group("a")).unwrap();
        let a1 = s.add_child(&a, Record::object()).unwrap();
        let a2 = s.add_child(&a, Record::group("a")).unwrap();
        let a2x = s.add_child(&a2, Record::object()).unwrap();
        let b = s.add_child(&root, Record::object()).unwrap();

        let walked: Vec<(String, usize)> = s
            .walk(&root)
            .unwrap()
            .map(|(r, depth)| (r.id, depth))
            .collect();
        assert_eq!(
            walked,
            vec![(a, 1), (a1, 2), (a2, 2), (a2x, 3), (b, 1)]
        );
    }

    #[test]
    fn test_object_has_no_children() {
        let mut s = RecordStore::in_memory().unwrap();
        let obj = s.add(Record::object()).unwrap();
        assert_eq!(s.walk(&obj).unwrap().count(), 0);
    }

    #[test]
    fn test_cycle_terminates() {
        let mut s = RecordStore::in_memory().unwrap();
        let root = s.add(Record::group("a")).unwrap();
        let sub = s.add_child(&root, Record::group("a")).unwrap();
        // corrupt the tree so the child lists its parent
        let root_for_cycle = root.clone();
        s.update(&sub, move |r| {
            if let Some(body) = r.group_body_mut() {
                body.children_id.push(root_for_cycle);
            }
        })
        .unwrap();

        let walked: Vec<_> = s.walk(&root).unwrap().collect();
        assert_eq!(walked.len(), 1);
        assert_eq!(walked[0].0.id, sub);
        assert_eq!(walked[0].0.kind(), RecordKind::Group);
    }

    #[test]
    fn test_deep_chain() {
        let mut s = RecordStore::in_memory().unwrap();
        let root = s.add(Record::group("a")).unwrap();
        let mut parent = root.clone();
        for _ in 0..200 {
            parent = s.add_child(&parent, Record::group("a")).unwrap();
        }
        let max_depth = s.walk(&root).unwrap().map(|(_, d)| d).max();
        assert_eq!(max_depth, Some(200));
    }
}
