//! In-memory storage backend, selected by the `memory://` spill URI.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_mem::error::{Error as MemError, Result as MemResult};
use strata_mem::Storage;

/// Thread-safe map from path to bytes. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.data.lock().contains_key(path)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Total stored bytes.
    pub fn total_bytes(&self) -> usize {
        self.data.lock().values().map(Vec::len).sum()
    }
}

impl Storage for MemoryStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        self.data.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let data = self.data.lock();
        let bytes = data
            .get(path)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))?;
        let start = offset as usize;
        bytes
            .get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                MemError::Storage(format!(
                    "range {start}+{len} exceeds size {} of {path}",
                    bytes.len()
                ))
            })
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        self.data.lock().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        Ok(self
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        self.data
            .lock()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_range_and_bounds() {
        let storage = MemoryStorage::new();
        storage.write("test/file", b"hello world").unwrap();
        assert_eq!(storage.read_range("test/file", 6, 5).unwrap(), b"world");
        assert!(storage.read_range("test/file", 6, 50).is_err());
        assert!(storage.read_range("missing", 0, 1).is_err());
    }

    #[test]
    fn list_by_prefix_and_delete() {
        let storage = MemoryStorage::new();
        storage.write("a/1", b"x").unwrap();
        storage.write("a/2", b"yy").unwrap();
        storage.write("b/1", b"z").unwrap();
        assert_eq!(storage.list("a/").unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(storage.total_bytes(), 4);
        storage.delete("a/1").unwrap();
        storage.delete("a/1").unwrap();
        assert_eq!(storage.len(), 2);
        assert!(storage.clone().contains("a/2"));
    }
}
