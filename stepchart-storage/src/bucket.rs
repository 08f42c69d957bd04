//! Buckets: nested views over a byte storage.

use crate::error::StorageError;
use crate::key::{KeyPath, KeySegment};
use crate::value::BucketValue;
use parking_lot::Mutex;
use std::sync::Arc;
use stepchart_wal::Storage;

/// Byte storage shared by every bucket of one persisted record tree.
pub type SharedStorage = Arc<Mutex<dyn Storage>>;

/// A key/value view rooted at a key path.
///
/// Every key written through a bucket is prefixed by the bucket's path, so a
/// nested bucket addresses a subtree of its parent. Cloning is cheap: clones
/// share the storage.
#[derive(Clone)]
pub struct Bucket {
    storage: SharedStorage,
    prefix: KeyPath,
}

impl Bucket {
    /// Creates the root bucket over `storage`.
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            prefix: KeyPath::root(),
        }
    }

    /// Returns a bucket rooted at `key` below this one.
    pub fn nested(&self, key: impl KeySegment) -> Result<Bucket, StorageError> {
        Ok(Bucket {
            storage: self.storage.clone(),
            prefix: self.prefix.join(key)?,
        })
    }

    /// Stores `value` under `key`.
    pub fn add<V: BucketValue>(&self, key: impl KeySegment, value: &V) -> Result<(), StorageError> {
        let path = self.prefix.join(key)?;
        let bytes = value.to_bytes()?;
        self.storage.lock().set(path.as_bytes(), &bytes);
        Ok(())
    }

    /// Reads the value under `key`, if present.
    pub fn try_get<V: BucketValue>(&self, key: impl KeySegment) -> Result<Option<V>, StorageError> {
        let path = self.prefix.join(key)?;
        let storage = self.storage.lock();
        storage.get(path.as_bytes()).map(V::decode).transpose()
    }

    /// Reads the value under `key`, or `default` if it is absent.
    pub fn get_or<V: BucketValue>(
        &self,
        key: impl KeySegment,
        default: V,
    ) -> Result<V, StorageError> {
        Ok(self.try_get(key)?.unwrap_or(default))
    }

    /// Removes the single value under `key`.
    pub fn remove(&self, key: impl KeySegment) -> Result<(), StorageError> {
        let path = self.prefix.join(key)?;
        self.storage.lock().remove(path.as_bytes());
        Ok(())
    }

    /// Removes `key` and every key nested below it.
    pub fn remove_subtree(&self, key: impl KeySegment) -> Result<(), StorageError> {
        let path = self.prefix.join(key)?;
        self.storage.lock().remove_all(path.as_bytes());
        Ok(())
    }

    /// Removes every key in this bucket.
    pub fn clear(&self) {
        self.storage.lock().remove_all(self.prefix.as_bytes());
    }

    /// Returns the bucket's key path.
    pub fn path(&self) -> &KeyPath {
        &self.prefix
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("prefix", &self.prefix)
            .finish()
    }
}
