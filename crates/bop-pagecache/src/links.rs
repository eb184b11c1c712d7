//! Index-addressed doubly-linked list.
//!
//! Nodes are frame numbers of the buffer pool arena; the prev/next links live
//! in a side table owned by the list, so a frame can sit in several lists
//! (LRU and dirty index) at once without aliasing.

/// Stable index of a node in the arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    linked: bool,
}

#[derive(Debug, Clone)]
pub struct IndexList {
    links: Vec<Link>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl IndexList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            links: vec![Link::default(); capacity],
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.links.get(node).is_some_and(|link| link.linked)
    }

    pub fn front(&self) -> Option<NodeId> {
        self.head
    }

    pub fn back(&self) -> Option<NodeId> {
        self.tail
    }

    /// Node towards the back.
    pub fn next(&self, node: NodeId) -> Option<NodeId> {
        self.links[node].next
    }

    /// Node towards the front.
    pub fn prev(&self, node: NodeId) -> Option<NodeId> {
        self.links[node].prev
    }

    pub fn push_front(&mut self, node: NodeId) {
        debug_assert!(!self.contains(node), "node {node} already linked");
        let old_head = self.head;
        self.links[node] = Link {
            prev: None,
            next: old_head,
            linked: true,
        };
        match old_head {
            Some(head) => self.links[head].prev = Some(node),
            None => self.tail = Some(node),
        }
        self.head = Some(node);
        self.len += 1;
    }

    pub fn push_back(&mut self, node: NodeId) {
        debug_assert!(!self.contains(node), "node {node} already linked");
        let old_tail = self.tail;
        self.links[node] = Link {
            prev: old_tail,
            next: None,
            linked: true,
        };
        match old_tail {
            Some(tail) => self.links[tail].next = Some(node),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Links `node` directly behind `anchor`.
    pub fn insert_after(&mut self, anchor: NodeId, node: NodeId) {
        debug_assert!(self.contains(anchor), "anchor {anchor} not linked");
        debug_assert!(!self.contains(node), "node {node} already linked");
        let next = self.links[anchor].next;
        self.links[node] = Link {
            prev: Some(anchor),
            next,
            linked: true,
        };
        self.links[anchor].next = Some(node);
        match next {
            Some(next) => self.links[next].prev = Some(node),
            None => self.tail = Some(node),
        }
        self.len += 1;
    }

    /// Unlinks `node`; returns false if it was not linked.
    pub fn remove(&mut self, node: NodeId) -> bool {
        if !self.contains(node) {
            return false;
        }
        let Link { prev, next, .. } = self.links[node];
        match prev {
            Some(prev) => self.links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.links[next].prev = prev,
            None => self.tail = prev,
        }
        self.links[node] = Link::default();
        self.len -= 1;
        true
    }

    /// Puts `new` in the position of `old`, which is unlinked.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        debug_assert!(self.contains(old), "node {old} not linked");
        match self.links[old].prev {
            Some(prev) => {
                self.remove(old);
                self.insert_after(prev, new);
            }
            None => {
                self.remove(old);
                self.push_front(new);
            }
        }
    }

    /// Iterates from front to back.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Iterates from back to front.
    pub fn iter_rev(&self) -> RevIter<'_> {
        RevIter {
            list: self,
            cursor: self.tail,
        }
    }
}

pub struct Iter<'a> {
    list: &'a IndexList,
    cursor: Option<NodeId>,
}

impl Iterator for Iter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.cursor?;
        self.cursor = self.list.links[node].next;
        Some(node)
    }
}

pub struct RevIter<'a> {
    list: &'a IndexList,
    cursor: Option<NodeId>,
}

impl Iterator for RevIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.cursor?;
        self.cursor = self.list.links[node].prev;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &IndexList) -> Vec<NodeId> {
        list.iter().collect()
    }

    #[test]
    fn push_and_remove() {
        let mut list = IndexList::with_capacity(8);
        list.push_front(1);
        list.push_front(2);
        list.push_back(3);
        assert_eq!(collect(&list), vec![2, 1, 3]);
        assert_eq!(list.iter_rev().collect::<Vec<_>>(), vec![3, 1, 2]);

        assert!(list.remove(1));
        assert!(!list.remove(1));
        assert_eq!(collect(&list), vec![2, 3]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.front(), Some(2));
        assert_eq!(list.back(), Some(3));
    }

    #[test]
    fn insert_after_tail_moves_tail() {
        let mut list = IndexList::with_capacity(4);
        list.push_front(0);
        list.insert_after(0, 3);
        list.insert_after(0, 2);
        assert_eq!(collect(&list), vec![0, 2, 3]);
        assert_eq!(list.back(), Some(3));
        assert_eq!(list.prev(3), Some(2));
    }

    #[test]
    fn replace_keeps_position() {
        let mut list = IndexList::with_capacity(8);
        for node in [1, 2, 3] {
            list.push_back(node);
        }
        list.replace(2, 7);
        assert_eq!(collect(&list), vec![1, 7, 3]);
        list.replace(1, 5);
        assert_eq!(collect(&list), vec![5, 7, 3]);
        assert!(!list.contains(1));
        assert!(!list.contains(2));
    }
}
