//! Key-value backends
//!
//! The engine persists through the [`Backend`] trait: a flat namespace of
//! string keys with opaque values, a sequential retrieval cursor for loading,
//! and an explicit flush to durable media. Two implementations ship with the
//! crate:
//!
//! - [`MemoryStore`]: a shared in-memory map that also records every write,
//!   used to observe the engine in tests
//! - [`FileStore`]: a memory-mapped append-only record log with a
//!   CRC-protected control block and per-record CRCs
//!
//! The on-disk structures of the file store live here:
//!
//! - [`ControlBlock`] at offset 0 tracks the end of the log
//! - every record starts with a [`RecordHeader`] followed by the key and value

pub mod cursor;
pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::{MemoryStore, WriteOp};

use crate::error::StoreError;
use crc32fast::Hasher;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// One persisted record as returned by the retrieval cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Storage key, e.g. `NetKey/3`
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
}

/// Persistent key-value store used by the engine
///
/// Calls are strictly sequential; the engine keeps the backend behind its own
/// mutex.
pub trait Backend: Send + 'static {
    /// Reset the retrieval cursor to the first record
    fn rewind(&mut self) -> Result<()>;

    /// Next live record, or `None` at the end of data
    ///
    /// The order is unspecified but stable between a `rewind` and the end.
    fn retrieve_next(&mut self) -> Result<Option<StoredRecord>>;

    /// Store `value` under `key`. `None` or an empty value deletes the key.
    fn update(&mut self, key: &str, value: Option<&[u8]>) -> Result<()>;

    /// Delete every record
    fn erase_all(&mut self) -> Result<()>;

    /// Make all completed updates durable
    fn flush(&mut self) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn retrieve_next(&mut self) -> Result<Option<StoredRecord>> {
        (**self).retrieve_next()
    }

    fn update(&mut self, key: &str, value: Option<&[u8]>) -> Result<()> {
        (**self).update(key, value)
    }

    fn erase_all(&mut self) -> Result<()> {
        (**self).erase_all()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Store control block, kept at offset 0 of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Magic number to identify the store format (0x4D534554 = "MSET")
    pub magic: u32,
    /// Version of the store format
    pub version: u32,
    /// Size of the record log in bytes
    pub log_size: u64,
    /// End of the last committed record
    pub write_pos: u64,
    /// Number of times the log has been compacted
    pub compactions: u64,
    /// CRC32 of the preceding fields
    pub crc32: u32,
}

impl ControlBlock {
    /// Encoded size in bytes
    pub const SIZE: usize = 36;

    /// Magic number for store identification ("MSET")
    pub const MAGIC: u32 = 0x4D53_4554;

    /// Current store format version
    pub const VERSION: u32 = 1;

    /// Control block for an empty log
    pub fn new(log_size: u64) -> Self {
        let mut block = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            log_size,
            write_pos: 0,
            compactions: 0,
            crc32: 0,
        };
        block.update_crc();
        block
    }

    fn body(&self) -> [u8; Self::SIZE - 4] {
        let mut out = [0u8; Self::SIZE - 4];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.log_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.write_pos.to_le_bytes());
        out[24..32].copy_from_slice(&self.compactions.to_le_bytes());
        out
    }

    /// Calculate CRC32 over all other fields and store it
    pub fn update_crc(&mut self) {
        let mut hasher = Hasher::new();
        hasher.update(&self.body());
        self.crc32 = hasher.finalize();
    }

    /// Verify the stored CRC32
    pub fn verify_crc(&self) -> bool {
        let mut hasher = Hasher::new();
        hasher.update(&self.body());
        self.crc32 == hasher.finalize()
    }

    /// Serialize, little-endian
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..Self::SIZE - 4].copy_from_slice(&self.body());
        out[Self::SIZE - 4..].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Deserialize; `None` when `bytes` is too short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::SIZE] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Some(Self {
            magic: u32_at(0),
            version: u32_at(4),
            log_size: u64_at(8),
            write_pos: u64_at(16),
            compactions: u64_at(24),
            crc32: u32_at(32),
        })
    }

    /// Magic, version and CRC all check out
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION && self.verify_crc()
    }
}

/// Header preceding every record in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// A marker indicating a record (0xAA55)
    pub marker: u16,
    /// Key length in bytes
    pub key_len: u16,
    /// Value length in bytes; zero marks a deletion
    pub value_len: u32,
    /// CRC32 of key and value
    pub crc32: u32,
}

impl RecordHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Marker value for records
    pub const MARKER: u16 = 0xAA55;

    /// Header for `key` and `value`, CRC included
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            marker: Self::MARKER,
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            crc32: Self::checksum(key, value),
        }
    }

    fn checksum(key: &[u8], value: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(key);
        hasher.update(value);
        hasher.finalize()
    }

    /// Verify the CRC32 of a key and value against the stored CRC
    pub fn verify_crc(&self, key: &[u8], value: &[u8]) -> bool {
        self.crc32 == Self::checksum(key, value)
    }

    /// Check if this header carries the record marker
    pub fn is_valid(&self) -> bool {
        self.marker == Self::MARKER
    }

    /// Size of the header plus payload
    pub fn record_size(&self) -> usize {
        Self::SIZE + usize::from(self.key_len) + self.value_len as usize
    }

    /// Serialize, little-endian
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.marker.to_le_bytes());
        out[2..4].copy_from_slice(&self.key_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.value_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Deserialize; `None` when `bytes` is too short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        Some(Self {
            marker: u16::from_le_bytes([bytes[0], bytes[1]]),
            key_len: u16::from_le_bytes([bytes[2], bytes[3]]),
            value_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            crc32: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_block_crc() {
        let mut block = ControlBlock::new(4096);
        assert!(block.is_valid());

        block.write_pos = 100;
        assert!(!block.verify_crc());
        block.update_crc();

        let decoded = ControlBlock::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_record_header() {
        let header = RecordHeader::new(b"Seq", &[1, 2, 3]);
        assert!(header.is_valid());
        assert_eq!(header.record_size(), RecordHeader::SIZE + 6);
        assert!(header.verify_crc(b"Seq", &[1, 2, 3]));
        assert!(!header.verify_crc(b"Seq", &[1, 2, 4]));

        let decoded = RecordHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert!(RecordHeader::from_bytes(&[0; 4]).is_none());
    }
}
