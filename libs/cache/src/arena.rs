//! Index-addressed doubly linked list used as the recency ordering.
//!
//! Nodes live in a slot vector and refer to their neighbours by slot index,
//! so the list never holds references into itself. Freed slots are recycled
//! through a free list.

use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    /// `None` when expiry is disabled.
    pub(crate) expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, value: V, expires_at: Option<Instant>) -> Self {
        Self {
            key,
            value,
            expires_at,
            prev: None,
            next: None,
        }
    }

    /// True once the expiration instant lies strictly in the past.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Recency list. The front is the most recently used node.
#[derive(Debug)]
pub(crate) struct RecencyList<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K, V> RecencyList<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            // One extra slot: an insert briefly exceeds capacity before the
            // compensating eviction.
            slots: Vec::with_capacity(capacity + 1),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn node(&self, idx: usize) -> &Node<K, V> {
        self.slots[idx]
            .as_ref()
            .expect("recency list slot referenced by the index must be occupied")
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.slots[idx]
            .as_mut()
            .expect("recency list slot referenced by the index must be occupied")
    }

    /// Least recently used slot.
    pub(crate) fn back(&self) -> Option<usize> {
        self.tail
    }

    /// Insert a node at the front and return its slot.
    pub(crate) fn push_front(&mut self, node: Node<K, V>) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.link_front(idx);
        idx
    }

    pub(crate) fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Unlink a slot, free it and hand back its node.
    pub(crate) fn remove(&mut self, idx: usize) -> Node<K, V> {
        self.unlink(idx);
        let node = self.slots[idx]
            .take()
            .expect("recency list slot referenced by the index must be occupied");
        self.free.push(idx);
        node
    }

    /// Slots from most to least recently used.
    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head {
            self.node_mut(head).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node_mut(idx);
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }
}

pub(crate) struct Iter<'a, K, V> {
    list: &'a RecencyList<K, V>,
    cursor: Option<usize>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (usize, &'a Node<K, V>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.node(idx);
        self.cursor = node.next;
        Some((idx, node))
    }
}
