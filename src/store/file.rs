//! Memory-mapped record log backend
//!
//! The store file holds a [`ControlBlock`] followed by a fixed-size log of
//! records. Updates append a record and then advance the committed write
//! position in the control block, so a write interrupted halfway leaves the
//! previous state intact. Deletes append a tombstone.
//!
//! On open the log is scanned once to build an in-memory index of live keys.
//! A record failing validation ends the scan and everything after it is
//! discarded. When an append does not fit, the log is compacted: the live
//! records are written to a side file next to the store, which is synced and
//! then renamed over the store. A crash before the rename leaves the old log in
//! place, and the leftover side file is removed on the next open.

use crate::error::StoreError;
use crate::store::cursor::LogCursor;
use crate::store::{Backend, ControlBlock, RecordHeader, Result, StoredRecord};
use memmap2::{MmapMut, MmapOptions};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File-backed [`Backend`]
pub struct FileStore {
    /// Path to the store file
    path: PathBuf,
    /// Memory-mapped file
    mmap: MmapMut,
    /// In-memory copy of the control block
    control: ControlBlock,
    /// Live records by key
    index: BTreeMap<String, Vec<u8>>,
    /// Keys left to return from the retrieval cursor
    pending_reads: Vec<String>,
    /// Appends since the last flush
    dirty: bool,
}

impl FileStore {
    /// Create or open a store at the given path
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the store file
    /// * `log_size` - Size of the record log in bytes (ignored if the file already exists)
    pub fn open<P: AsRef<Path>>(path: P, log_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_unfinished_compaction(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let is_new = file.metadata()?.len() == 0;
        if is_new {
            file.set_len((ControlBlock::SIZE + log_size) as u64)?;
        }

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let control = if is_new {
            let control = ControlBlock::new(log_size as u64);
            mmap[..ControlBlock::SIZE].copy_from_slice(&control.to_bytes());
            mmap.flush()?;
            control
        } else {
            let control = ControlBlock::from_bytes(&mmap).ok_or(StoreError::InvalidStore)?;
            let mapped = mmap.len() as u64;
            if !control.is_valid() || ControlBlock::SIZE as u64 + control.log_size > mapped {
                return Err(StoreError::InvalidStore);
            }
            control
        };

        let mut store = Self {
            path,
            mmap,
            control,
            index: BTreeMap::new(),
            pending_reads: Vec::new(),
            dirty: false,
        };
        store.scan()?;
        Ok(store)
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a copy of the control block
    pub fn control_block(&self) -> ControlBlock {
        self.control
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// No live keys
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Current value of `key`
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.index.get(key).map(Vec::as_slice)
    }

    fn log(&self) -> &[u8] {
        let end = ControlBlock::SIZE + self.control.log_size as usize;
        &self.mmap[ControlBlock::SIZE..end]
    }

    /// Rebuild the index from the log, dropping a torn tail
    fn scan(&mut self) -> Result<()> {
        let mut index = BTreeMap::new();
        let mut cursor = LogCursor::new(self.log(), self.control.write_pos);
        for record in cursor.by_ref() {
            if record.is_tombstone() {
                index.remove(&record.key);
            } else {
                index.insert(record.key, record.value);
            }
        }
        let valid_end = cursor.offset();

        if let Some(stop) = cursor.stopped() {
            warn!(
                path = %self.path.display(),
                offset = valid_end,
                reason = ?stop,
                "discarding damaged tail of settings log"
            );
            self.control.write_pos = valid_end;
            self.write_control()?;
            self.mmap.flush()?;
        }

        debug!(records = index.len(), end = valid_end, "settings log scanned");
        self.index = index;
        Ok(())
    }

    fn write_control(&mut self) -> Result<()> {
        self.control.update_crc();
        self.mmap[..ControlBlock::SIZE].copy_from_slice(&self.control.to_bytes());
        Ok(())
    }

    /// Write one record at the current write position, without committing it
    fn put_record(&mut self, key: &str, value: &[u8]) -> u64 {
        let pos = self.control.write_pos;
        write_record(&mut self.mmap[ControlBlock::SIZE..], pos, key, value)
    }

    fn fits(&self, size: usize) -> bool {
        self.control.write_pos + size as u64 <= self.control.log_size
    }

    /// Append and commit one record, compacting first when full
    fn append(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let size = RecordHeader::SIZE + key.len() + value.len();
        if key.len() > usize::from(u16::MAX) {
            return Err(StoreError::RecordTooLarge {
                key: key.to_string(),
                size,
            });
        }

        if !self.fits(size) {
            self.compact()?;
            if !self.fits(size) {
                return Err(StoreError::RecordTooLarge {
                    key: key.to_string(),
                    size,
                });
            }
        }

        self.control.write_pos = self.put_record(key, value);
        self.write_control()?;
        self.dirty = true;
        Ok(())
    }

    /// Rewrite the log with only live records
    ///
    /// The store file is only replaced once the compacted copy is on disk.
    pub fn compact(&mut self) -> Result<()> {
        let side_path = compaction_path(&self.path);
        let (mmap, control) = match self.write_compacted(&side_path) {
            Ok(compacted) => compacted,
            Err(err) => {
                let _ = fs::remove_file(&side_path);
                return Err(err);
            }
        };
        if let Err(err) = fs::rename(&side_path, &self.path) {
            let _ = fs::remove_file(&side_path);
            return Err(err.into());
        }

        self.mmap = mmap;
        self.control = control;
        self.dirty = false;

        info!(
            records = self.index.len(),
            used = self.control.write_pos,
            compactions = self.control.compactions,
            "settings log compacted"
        );
        Ok(())
    }

    /// Write the live records and a new control block to `side_path`
    fn write_compacted(&self, side_path: &Path) -> Result<(MmapMut, ControlBlock)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(side_path)?;
        file.set_len(self.mmap.len() as u64)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let mut control = self.control;
        control.write_pos = 0;
        control.compactions += 1;
        for (key, value) in &self.index {
            let size = RecordHeader::SIZE + key.len() + value.len();
            if control.write_pos + size as u64 > control.log_size {
                return Err(StoreError::RecordTooLarge {
                    key: key.clone(),
                    size,
                });
            }
            control.write_pos =
                write_record(&mut mmap[ControlBlock::SIZE..], control.write_pos, key, value);
        }
        control.update_crc();
        mmap[..ControlBlock::SIZE].copy_from_slice(&control.to_bytes());
        mmap.flush()?;
        file.sync_all()?;

        Ok((mmap, control))
    }
}

/// Side file a compaction is built in
fn compaction_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".compact");
    PathBuf::from(name)
}

/// Drop a side file left behind by an interrupted compaction
fn remove_unfinished_compaction(path: &Path) -> Result<()> {
    let side_path = compaction_path(path);
    match fs::remove_file(&side_path) {
        Ok(()) => {
            warn!(path = %side_path.display(), "removed unfinished compaction");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Write one record at `pos` of `log`, returning the position after it
fn write_record(log: &mut [u8], pos: u64, key: &str, value: &[u8]) -> u64 {
    let header = RecordHeader::new(key.as_bytes(), value);
    let start = pos as usize;
    let key_start = start + RecordHeader::SIZE;
    let value_start = key_start + key.len();

    log[start..key_start].copy_from_slice(&header.to_bytes());
    log[key_start..value_start].copy_from_slice(key.as_bytes());
    log[value_start..value_start + value.len()].copy_from_slice(value);

    pos + header.record_size() as u64
}

impl Backend for FileStore {
    fn rewind(&mut self) -> Result<()> {
        // Popped from the back
        self.pending_reads = self.index.keys().rev().cloned().collect();
        Ok(())
    }

    fn retrieve_next(&mut self) -> Result<Option<StoredRecord>> {
        while let Some(key) = self.pending_reads.pop() {
            if let Some(value) = self.index.get(&key) {
                return Ok(Some(StoredRecord {
                    value: value.clone(),
                    key,
                }));
            }
        }
        Ok(None)
    }

    fn update(&mut self, key: &str, value: Option<&[u8]>) -> Result<()> {
        match value.filter(|value| !value.is_empty()) {
            Some(value) => {
                if self.index.get(key).is_some_and(|current| current == value) {
                    return Ok(());
                }
                self.append(key, value)?;
                self.index.insert(key.to_string(), value.to_vec());
            }
            None => {
                if !self.index.contains_key(key) {
                    debug!(key, "nothing stored to delete");
                    return Ok(());
                }
                self.append(key, &[])?;
                self.index.remove(key);
            }
        }
        Ok(())
    }

    fn erase_all(&mut self) -> Result<()> {
        self.index.clear();
        self.pending_reads.clear();
        self.control.write_pos = 0;
        self.write_control()?;
        self.mmap.flush()?;
        self.dirty = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.mmap.flush()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_new_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.dat");

        let store = FileStore::open(&path, 1024).unwrap();
        let control = store.control_block();
        assert_eq!(control.magic, ControlBlock::MAGIC);
        assert_eq!(control.version, ControlBlock::VERSION);
        assert_eq!(control.log_size, 1024);
        assert_eq!(control.write_pos, 0);
        assert!(control.verify_crc());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unchanged_value_is_not_rewritten() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("settings.dat"), 1024).unwrap();

        store.update("Seq", Some(&[1, 0, 0])).unwrap();
        let used = store.control_block().write_pos;
        store.update("Seq", Some(&[1, 0, 0])).unwrap();
        assert_eq!(store.control_block().write_pos, used);

        // Deleting an absent key appends nothing
        store.update("RPL/1", None).unwrap();
        assert_eq!(store.control_block().write_pos, used);
    }

    #[test]
    fn test_retrieve_returns_live_records_once() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("settings.dat"), 1024).unwrap();
        store.update("Seq", Some(&[1, 0, 0])).unwrap();
        store.update("Role", Some(&[1])).unwrap();
        store.update("Seq", Some(&[])).unwrap();

        store.rewind().unwrap();
        let first = store.retrieve_next().unwrap().unwrap();
        assert_eq!(first.key, "Role");
        assert!(store.retrieve_next().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_control_block_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        FileStore::open(&path, 256).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(FileStore::open(&path, 256), Err(StoreError::InvalidStore)));
    }
}
