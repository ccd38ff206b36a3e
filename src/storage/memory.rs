//! In-memory storage backend (BTreeMap-based), adapted from the reference
//! crate's `MemoryBackend`.

use super::{StorageBackend, StorageOp, StorageStats};
use crate::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;

/// In-memory backend with no durability guarantee. Backs tests and
/// ephemeral (non-persisted) embeddings of the engine.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: BTreeMap<Bytes, Bytes>,
    operations_count: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        self.operations_count += 1;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.get(key).cloned())
    }

    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.operations_count += 1;
        Ok(self.data.remove(key))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        Ok(self
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.data.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.data.is_empty())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            key_count: self.data.len(),
            size_bytes: self.data.iter().map(|(k, v)| k.len() + v.len()).sum(),
            operations_count: self.operations_count,
        })
    }

    fn batch(&mut self, ops: &[StorageOp]) -> Result<()> {
        for op in ops {
            match op {
                StorageOp::Put { key, value } => self.put(key, value)?,
                StorageOp::Delete { key } => {
                    self.delete(key)?;
                }
            }
        }
        Ok(())
    }
}
