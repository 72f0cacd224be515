//! In-memory backend
//!
//! [`MemoryStore`] is a cloneable handle to a shared map. The engine owns one
//! clone while a test keeps another to inspect what was written, seed raw
//! records and inject failures.

use crate::error::StoreError;
use crate::store::{Backend, Result, StoredRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One `update` call observed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Value stored under a key
    Store(String, Vec<u8>),
    /// Key deleted
    Delete(String),
}

impl WriteOp {
    /// Key the operation touched
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Store(key, _) | WriteOp::Delete(key) => key,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<String, Vec<u8>>,
    writes: Vec<WriteOp>,
    pending_reads: Vec<String>,
    flushes: usize,
    erases: usize,
    /// Updates left before writes start failing
    fail_after: Option<usize>,
    unavailable: bool,
}

/// Shared in-memory [`Backend`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw record without logging it as a write
    pub fn seed(&self, key: &str, value: &[u8]) {
        self.inner.lock().records.insert(key.to_string(), value.to_vec());
    }

    /// Current value of `key`
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().records.get(key).cloned()
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().records.keys().cloned().collect()
    }

    /// Every `update` call so far
    pub fn writes(&self) -> Vec<WriteOp> {
        self.inner.lock().writes.clone()
    }

    /// Return and forget the write log
    pub fn take_writes(&self) -> Vec<WriteOp> {
        std::mem::take(&mut self.inner.lock().writes)
    }

    /// Number of `update` calls touching `key`
    pub fn writes_to(&self, key: &str) -> usize {
        self.inner.lock().writes.iter().filter(|op| op.key() == key).count()
    }

    /// Number of `flush` calls
    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }

    /// Number of `erase_all` calls
    pub fn erase_count(&self) -> usize {
        self.inner.lock().erases
    }

    /// Let `count` more updates succeed, then fail every update
    pub fn fail_writes_after(&self, count: usize) {
        self.inner.lock().fail_after = Some(count);
    }

    /// Make every operation fail until [`MemoryStore::heal`]
    pub fn set_unavailable(&self) {
        self.inner.lock().unavailable = true;
    }

    /// Clear injected failures
    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.fail_after = None;
        inner.unavailable = false;
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("memory store marked unavailable".to_string())
}

impl Backend for MemoryStore {
    fn rewind(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(unavailable());
        }
        inner.pending_reads = inner.records.keys().rev().cloned().collect();
        Ok(())
    }

    fn retrieve_next(&mut self) -> Result<Option<StoredRecord>> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(unavailable());
        }
        while let Some(key) = inner.pending_reads.pop() {
            if let Some(value) = inner.records.get(&key).cloned() {
                return Ok(Some(StoredRecord { key, value }));
            }
        }
        Ok(None)
    }

    fn update(&mut self, key: &str, value: Option<&[u8]>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(unavailable());
        }
        if let Some(left) = inner.fail_after.as_mut() {
            if *left == 0 {
                return Err(StoreError::Io(std::io::Error::other(format!(
                    "injected write failure for {key}"
                ))));
            }
            *left -= 1;
        }

        match value.filter(|value| !value.is_empty()) {
            Some(value) => {
                inner.records.insert(key.to_string(), value.to_vec());
                inner.writes.push(WriteOp::Store(key.to_string(), value.to_vec()));
            }
            None => {
                inner.records.remove(key);
                inner.writes.push(WriteOp::Delete(key.to_string()));
            }
        }
        Ok(())
    }

    fn erase_all(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(unavailable());
        }
        inner.records.clear();
        inner.pending_reads.clear();
        inner.erases += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(unavailable());
        }
        inner.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_handle_sees_writes() {
        let observer = MemoryStore::new();
        let mut store = observer.clone();

        store.update("Seq", Some(&[1, 2, 3])).unwrap();
        store.update("Seq", None).unwrap();

        assert_eq!(observer.writes_to("Seq"), 2);
        assert_eq!(observer.get("Seq"), None);
        assert_eq!(
            observer.take_writes(),
            vec![WriteOp::Store("Seq".into(), vec![1, 2, 3]), WriteOp::Delete("Seq".into())]
        );
        assert!(observer.writes().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let mut store = MemoryStore::new();
        store.fail_writes_after(1);

        assert!(store.update("Net", Some(&[0; 18])).is_ok());
        assert!(store.update("IV", Some(&[0; 5])).is_err());
        assert_eq!(store.keys(), vec!["Net".to_string()]);

        store.heal();
        assert!(store.update("IV", Some(&[0; 5])).is_ok());
    }

    #[test]
    fn test_seeded_records_are_retrieved() {
        let mut store = MemoryStore::new();
        store.seed("Role", &[1]);
        store.seed("Cfg", &[0; 7]);

        store.rewind().unwrap();
        let mut keys = Vec::new();
        while let Some(record) = store.retrieve_next().unwrap() {
            keys.push(record.key);
        }
        assert_eq!(keys, vec!["Cfg".to_string(), "Role".to_string()]);
        assert!(store.writes().is_empty());
    }
}
