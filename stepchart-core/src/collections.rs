//! In-memory collections of the execution context.
//!
//! These are plain data structures. Persisting their changes is the job of
//! [`ExecutionContext`](crate::context::ExecutionContext), which mutates them
//! and logs the delta in one call.

use crate::document::DocId;
use crate::event::InvokeId;
use std::collections::{BTreeMap, VecDeque};

/// An insertion-ordered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedSet<T> {
    items: Vec<T>,
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: PartialEq + Clone> OrderedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item` at the end unless present. Returns whether it was added.
    pub fn insert(&mut self, item: T) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Removes `item`. Returns whether it was present.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.items.iter().position(|i| i == item) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Returns whether any item satisfies `pred`.
    pub fn some(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.items.iter().any(pred)
    }

    /// Returns whether the two sets share an item.
    pub fn has_intersection(&self, other: &OrderedSet<T>) -> bool {
        self.items.iter().any(|i| other.contains(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

impl<T: PartialEq + Clone> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = OrderedSet::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

impl OrderedSet<DocId> {
    /// Items sorted by document order (entry order).
    pub fn in_document_order(&self) -> Vec<DocId> {
        let mut items = self.items.clone();
        items.sort();
        items
    }
}

/// History values: history node id to the states it restores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyList {
    entries: BTreeMap<DocId, Vec<DocId>>,
}

impl KeyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: DocId) -> Option<&[DocId]> {
        self.entries.get(&key).map(|v| v.as_slice())
    }

    pub fn set(&mut self, key: DocId, states: Vec<DocId>) {
        self.entries.insert(key, states);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A FIFO queue that numbers its slots.
///
/// Slot numbers only grow: `head` is the slot of the front item and `tail`
/// the slot the next pushed item gets. Persisted queues are addressed by
/// these numbers.
#[derive(Debug, Clone)]
pub struct EntityQueue<T> {
    items: VecDeque<T>,
    head: u64,
}

impl<T> Default for EntityQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            head: 0,
        }
    }
}

impl<T> EntityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue whose front item sits in slot `head`.
    pub fn from_parts(head: u64, items: Vec<T>) -> Self {
        Self {
            items: items.into(),
            head,
        }
    }

    /// Appends `item` and returns its slot.
    pub fn push(&mut self, item: T) -> u64 {
        let slot = self.tail();
        self.items.push_back(item);
        slot
    }

    /// Removes the front item, returning it with its slot.
    pub fn pop(&mut self) -> Option<(u64, T)> {
        let item = self.items.pop_front()?;
        let slot = self.head;
        self.head += 1;
        Some((slot, item))
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.head + self.items.len() as u64
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Active invokes, in start order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeIdSet {
    ids: Vec<InvokeId>,
}

impl InvokeIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: InvokeId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: &InvokeId) -> bool {
        match self.ids.iter().position(|i| i == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &InvokeId) -> bool {
        self.ids.contains(id)
    }

    /// Finds an active invoke by its chart-visible id.
    pub fn find_by_value(&self, value: &str) -> Option<&InvokeId> {
        self.ids.iter().find(|id| id.value == value)
    }

    /// Active invokes started from one of `nodes`.
    pub fn started_from(&self, nodes: &[DocId]) -> Vec<InvokeId> {
        self.ids
            .iter()
            .filter(|id| nodes.contains(&id.node))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvokeId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
