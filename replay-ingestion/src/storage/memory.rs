use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::blob::{BlobStore, BlobStoreError};
use crate::storage::file_parts::{FilePart, FilePartStore, FilePartStoreError};

/// In-process blob store. Keeps a log of `set` calls so callers can assert on
/// write amplification.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    writes: Mutex<Vec<(String, usize)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(key, size)` of every `set` call, in call order.
    pub fn writes(&self) -> Vec<(String, usize)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<(), BlobStoreError> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), data.len()));
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn get_range(
        &self,
        key: &str,
        start: u64,
        length: u64,
    ) -> Result<Bytes, BlobStoreError> {
        let data = self.get(key).await?;
        let invalid = || BlobStoreError::InvalidRange {
            key: key.to_string(),
            start,
            length,
        };

        let start_idx = usize::try_from(start).map_err(|_| invalid())?;
        let end_idx = usize::try_from(start + length).map_err(|_| invalid())?;
        if length == 0 || end_idx > data.len() {
            return Err(invalid());
        }
        Ok(data.slice(start_idx..end_idx))
    }
}

/// In-process file-part rows, used when no database is configured.
#[derive(Default)]
pub struct MemoryFilePartStore {
    parts: Mutex<HashMap<String, FilePart>>,
    inserts: Mutex<Vec<usize>>,
}

impl MemoryFilePartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row count of each `bulk_insert` call.
    pub fn insert_batches(&self) -> Vec<usize> {
        self.inserts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.parts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FilePartStore for MemoryFilePartStore {
    async fn bulk_insert(&self, parts: Vec<FilePart>) -> Result<(), FilePartStoreError> {
        self.inserts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(parts.len());
        let mut stored = self.parts.lock().unwrap_or_else(|e| e.into_inner());
        for part in parts {
            stored.insert(part.key.clone(), part);
        }
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<FilePart>, FilePartStoreError> {
        Ok(self
            .parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn count_by_filename(&self, filename: &str) -> Result<u64, FilePartStoreError> {
        let stored = self.parts.lock().unwrap_or_else(|e| e.into_inner());
        let count = stored.values().filter(|p| p.filename == filename).count();
        Ok(count as u64)
    }

    async fn delete_by_keys(&self, keys: &[String]) -> Result<u64, FilePartStoreError> {
        let mut stored = self.parts.lock().unwrap_or_else(|e| e.into_inner());
        let removed = keys.iter().filter(|k| stored.remove(*k).is_some()).count();
        Ok(removed as u64)
    }

    async fn update_retention(
        &self,
        keys: &[String],
        retention_days: i64,
    ) -> Result<u64, FilePartStoreError> {
        let mut stored = self.parts.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = 0;
        for key in keys {
            if let Some(part) = stored.get_mut(key) {
                part.retention_days = retention_days;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
