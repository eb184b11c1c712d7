//! Ordered index of dirty pages.
//!
//! The list runs from the most recently dirtied page at the head to the
//! oldest at the tail, ordered by `(oldest_modification DESC, space_id,
//! page_no)`. Checkpoint flushing consumes it from the tail.
//!
//! In steady state pages are dirtied in LSN order and land at the head in
//! O(1). While recovery replays redo out of order an ordered tree mirrors the
//! list so that the insertion point is found in O(log n); it is dropped once
//! recovery ends.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, trace};

use crate::links::{IndexList, NodeId};
use crate::log::Lsn;
use crate::page::PageId;

/// What the index remembers about a dirty frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyEntry {
    pub id: PageId,
    pub oldest_modification: Lsn,
}

type OrderKey = (Reverse<Lsn>, u32, u32, NodeId);

fn order_key(entry: &DirtyEntry, node: NodeId) -> OrderKey {
    (
        Reverse(entry.oldest_modification),
        entry.id.space_id,
        entry.id.page_no,
        node,
    )
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirtyIndexError {
    #[error("frame {node} has lsn {lsn}, below {older_lsn} found closer to the tail")]
    OutOfOrder { node: NodeId, lsn: Lsn, older_lsn: Lsn },
    #[error("frame {0} is linked but has no entry")]
    MissingEntry(NodeId),
    #[error("frame {0} is dirty with oldest_modification 0")]
    ZeroLsn(NodeId),
    #[error("list holds {list} frames, entries {entries}, recovery tree {tree:?}")]
    LengthMismatch {
        list: usize,
        entries: usize,
        tree: Option<usize>,
    },
    #[error("recovery tree order differs from the list at frame {0}")]
    TreeMismatch(NodeId),
}

#[derive(Debug)]
pub struct DirtyPageIndex {
    list: IndexList,
    entries: Vec<Option<DirtyEntry>>,
    recovery: Option<BTreeSet<OrderKey>>,
    count: usize,
}

impl DirtyPageIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: IndexList::with_capacity(capacity),
            entries: vec![None; capacity],
            recovery: None,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.get(node).is_some_and(Option::is_some)
    }

    pub fn entry(&self, node: NodeId) -> Option<DirtyEntry> {
        self.entries.get(node).copied().flatten()
    }

    pub fn recovery_order_enabled(&self) -> bool {
        self.recovery.is_some()
    }

    /// Starts maintaining the ordered tree for out-of-order insertion.
    pub fn enable_recovery_order(&mut self) {
        if self.recovery.is_some() {
            return;
        }
        let tree: BTreeSet<OrderKey> = self
            .list
            .iter()
            .filter_map(|node| self.entry(node).map(|entry| order_key(&entry, node)))
            .collect();
        debug!(entries = tree.len(), "dirty index recovery order enabled");
        self.recovery = Some(tree);
    }

    pub fn disable_recovery_order(&mut self) {
        if self.recovery.take().is_some() {
            debug!("dirty index recovery order disabled");
        }
    }

    /// Adds a newly dirtied frame.
    pub fn insert(&mut self, node: NodeId, id: PageId, oldest_modification: Lsn) {
        debug_assert!(oldest_modification != 0, "dirty page needs a nonzero lsn");
        debug_assert!(!self.contains(node), "frame {node} already dirty");
        let entry = DirtyEntry {
            id,
            oldest_modification,
        };
        let key = order_key(&entry, node);
        let fits_at_head = match self.list.front() {
            Some(head) => self
                .entry(head)
                .is_some_and(|head_entry| key <= order_key(&head_entry, head)),
            None => true,
        };
        self.entries[node] = Some(entry);
        if fits_at_head {
            self.list.push_front(node);
            if let Some(tree) = self.recovery.as_mut() {
                tree.insert(key);
            }
        } else {
            self.insert_sorted(node, key);
        }
        self.count += 1;
        trace!(node, page = %id, lsn = oldest_modification, "dirty page inserted");
    }

    fn insert_sorted(&mut self, node: NodeId, key: OrderKey) {
        let predecessor = match self.recovery.as_mut() {
            Some(tree) => {
                let predecessor = tree.range(..key).next_back().map(|k| k.3);
                tree.insert(key);
                predecessor
            }
            None => {
                let mut predecessor = None;
                for candidate in self.list.iter() {
                    let Some(entry) = self.entries[candidate] else {
                        break;
                    };
                    if order_key(&entry, candidate) < key {
                        predecessor = Some(candidate);
                    } else {
                        break;
                    }
                }
                predecessor
            }
        };
        match predecessor {
            Some(anchor) => self.list.insert_after(anchor, node),
            None => self.list.push_front(node),
        }
    }

    /// Drops a frame from the index, returning its entry.
    ///
    /// Removing a clean frame is a caller bug and returns `None`.
    pub fn remove(&mut self, node: NodeId) -> Option<DirtyEntry> {
        let entry = self.entries.get_mut(node)?.take()?;
        self.list.remove(node);
        if let Some(tree) = self.recovery.as_mut() {
            tree.remove(&order_key(&entry, node));
        }
        self.count -= 1;
        trace!(node, page = %entry.id, "dirty page removed");
        Some(entry)
    }

    /// Moves the entry of `old` to `new`, keeping its position.
    pub fn relocate(&mut self, old: NodeId, new: NodeId) -> bool {
        let Some(entry) = self.entries.get_mut(old).and_then(Option::take) else {
            return false;
        };
        debug_assert!(!self.contains(new), "frame {new} already dirty");
        self.list.replace(old, new);
        if let Some(tree) = self.recovery.as_mut() {
            tree.remove(&order_key(&entry, old));
            tree.insert(order_key(&entry, new));
        }
        self.entries[new] = Some(entry);
        true
    }

    /// Oldest dirty frame.
    pub fn tail(&self) -> Option<(NodeId, DirtyEntry)> {
        let node = self.list.back()?;
        self.entry(node).map(|entry| (node, entry))
    }

    /// Next newer frame after `node`.
    pub fn prev(&self, node: NodeId) -> Option<(NodeId, DirtyEntry)> {
        let prev = self.list.prev(node)?;
        self.entry(prev).map(|entry| (prev, entry))
    }

    /// Smallest `oldest_modification` currently in the index.
    pub fn oldest_lsn(&self) -> Option<Lsn> {
        self.tail().map(|(_, entry)| entry.oldest_modification)
    }

    /// Walks from the oldest frame to the newest.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = (NodeId, DirtyEntry)> + '_ {
        self.list
            .iter_rev()
            .filter_map(|node| self.entry(node).map(|entry| (node, entry)))
    }

    /// Checks ordering, bookkeeping and the recovery tree.
    pub fn validate(&self) -> Result<(), DirtyIndexError> {
        let entries = self.entries.iter().filter(|e| e.is_some()).count();
        let tree = self.recovery.as_ref().map(BTreeSet::len);
        if self.list.len() != self.count
            || entries != self.count
            || tree.is_some_and(|len| len != self.count)
        {
            return Err(DirtyIndexError::LengthMismatch {
                list: self.list.len(),
                entries,
                tree,
            });
        }

        let mut older_lsn: Lsn = 0;
        for node in self.list.iter_rev() {
            let entry = self.entry(node).ok_or(DirtyIndexError::MissingEntry(node))?;
            if entry.oldest_modification == 0 {
                return Err(DirtyIndexError::ZeroLsn(node));
            }
            if entry.oldest_modification < older_lsn {
                return Err(DirtyIndexError::OutOfOrder {
                    node,
                    lsn: entry.oldest_modification,
                    older_lsn,
                });
            }
            older_lsn = entry.oldest_modification;
        }

        if let Some(tree) = &self.recovery {
            for (node, key) in self.list.iter().zip(tree.iter()) {
                if key.3 != node {
                    return Err(DirtyIndexError::TreeMismatch(node));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn lsns_oldest_first(index: &DirtyPageIndex) -> Vec<Lsn> {
        index
            .iter_oldest_first()
            .map(|(_, entry)| entry.oldest_modification)
            .collect()
    }

    #[test]
    fn monotonic_inserts_land_at_head() {
        let mut index = DirtyPageIndex::new(8);
        for (node, lsn) in [(0, 10), (1, 20), (2, 30)] {
            index.insert(node, PageId::new(1, node as u32), lsn);
        }
        assert_eq!(index.tail().map(|(n, _)| n), Some(0));
        assert_eq!(lsns_oldest_first(&index), vec![10, 20, 30]);
        index.validate().expect("valid");
    }

    #[test]
    fn recovery_inserts_are_sorted() {
        let mut index = DirtyPageIndex::new(8);
        index.enable_recovery_order();
        for (node, lsn) in [(0, 5), (1, 3), (2, 8), (3, 1)] {
            index.insert(node, PageId::new(0, node as u32), lsn);
        }
        assert_eq!(lsns_oldest_first(&index), vec![1, 3, 5, 8]);
        index.validate().expect("valid");

        index.disable_recovery_order();
        assert!(!index.recovery_order_enabled());
        index.validate().expect("valid");
    }

    #[test]
    fn remove_clears_entry() {
        let mut index = DirtyPageIndex::new(4);
        index.insert(2, PageId::new(0, 2), 7);
        assert_eq!(index.remove(2).map(|e| e.oldest_modification), Some(7));
        assert!(index.remove(2).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn relocate_keeps_position() {
        let mut index = DirtyPageIndex::new(8);
        index.enable_recovery_order();
        for (node, lsn) in [(0, 10), (1, 20), (2, 30)] {
            index.insert(node, PageId::new(1, node as u32), lsn);
        }
        assert!(index.relocate(1, 5));
        assert!(!index.contains(1));
        let order: Vec<NodeId> = index.iter_oldest_first().map(|(n, _)| n).collect();
        assert_eq!(order, vec![0, 5, 2]);
        index.validate().expect("valid");
    }

    #[test]
    fn random_operations_preserve_order() {
        let mut rng = rand::rng();
        for recovery in [false, true] {
            let mut index = DirtyPageIndex::new(64);
            if recovery {
                index.enable_recovery_order();
            }
            for _ in 0..500 {
                let node = rng.random_range(0..64);
                if index.contains(node) {
                    index.remove(node);
                } else {
                    let lsn = rng.random_range(1..1_000u64);
                    index.insert(node, PageId::new(0, node as u32), lsn);
                }
                let lsns = lsns_oldest_first(&index);
                assert!(lsns.windows(2).all(|w| w[0] <= w[1]), "order broken: {lsns:?}");
            }
            index.validate().expect("valid");
        }
    }
}
