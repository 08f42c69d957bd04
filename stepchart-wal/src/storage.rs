//! Byte-level key/value storage.

use crate::entry::Operation;
use std::collections::BTreeMap;

/// An ordered byte store addressed by encoded key paths.
///
/// Keys of nested records share their parent's bytes as a prefix, so
/// `remove_all(prefix)` drops a whole subtree.
pub trait Storage: Send {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> Option<&[u8]>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Removes the value stored under `key`.
    fn remove(&mut self, key: &[u8]);

    /// Removes every key that starts with `prefix`.
    fn remove_all(&mut self, prefix: &[u8]);
}

/// Storage held entirely in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStorage {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a logged operation.
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Set { key, value } => self.set(key, value),
            Operation::Remove { key } => self.remove(key),
            Operation::RemoveAll { prefix } => self.remove_all(prefix),
        }
    }

    /// Returns the whole content as a list of `Set` operations.
    pub fn to_operations(&self) -> Vec<Operation> {
        self.entries
            .iter()
            .map(|(key, value)| Operation::Set {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Iterates entries whose key starts with `prefix`, in key order.
    pub fn scan<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> {
        self.entries
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.entries.insert(key.to_vec(), value.to_vec());
    }

    fn remove(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    fn remove_all(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            self.entries.clear();
            return;
        }

        let doomed: Vec<Vec<u8>> = self.scan(prefix).map(|(key, _)| key.to_vec()).collect();
        for key in doomed {
            self.entries.remove(&key);
        }
    }
}
