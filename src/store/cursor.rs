//! Sequential reader over the raw record log
//!
//! A [`LogCursor`] walks the records between the start of the log and the
//! committed write position. It does not interpret keys: later records for the
//! same key supersede earlier ones, and the file store folds them into its
//! index while scanning.
//!
//! The cursor stops at the first record that fails validation. Everything
//! before it is intact; the store treats the rest as a torn tail.

use crate::store::RecordHeader;

/// A raw record read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Offset of the header within the log
    pub offset: u64,
    /// Storage key
    pub key: String,
    /// Value; empty for a deletion
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Whether this record deletes its key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// Why a scan ended before the committed end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Header marker missing or header truncated
    BadHeader,
    /// Payload runs past the committed end
    Truncated,
    /// CRC mismatch
    Checksum,
    /// Key is not valid UTF-8
    BadKey,
}

/// Cursor over the records of a log section
pub struct LogCursor<'a> {
    /// Log bytes, starting after the control block
    log: &'a [u8],
    /// Offset of the next record
    offset: u64,
    /// End of committed data
    end: u64,
    /// Set once a record failed validation
    stopped: Option<ScanStop>,
}

impl<'a> LogCursor<'a> {
    /// Cursor over `log[..end]`
    pub fn new(log: &'a [u8], end: u64) -> Self {
        Self {
            log,
            offset: 0,
            end: end.min(log.len() as u64),
            stopped: None,
        }
    }

    /// Offset of the next record; after a stop, the end of valid data
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Check if the cursor has reached the committed end
    pub fn at_end(&self) -> bool {
        self.offset >= self.end
    }

    /// Reason the scan stopped early, if it did
    pub fn stopped(&self) -> Option<ScanStop> {
        self.stopped
    }

    /// Read the next record from the log
    fn read_next(&mut self) -> Result<Option<LogRecord>, ScanStop> {
        if self.at_end() {
            return Ok(None);
        }

        let start = self.offset as usize;
        let end = self.end as usize;

        let header = RecordHeader::from_bytes(&self.log[start..end]).ok_or(ScanStop::BadHeader)?;
        if !header.is_valid() {
            return Err(ScanStop::BadHeader);
        }

        let size = header.record_size();
        if start + size > end {
            return Err(ScanStop::Truncated);
        }

        let key_start = start + RecordHeader::SIZE;
        let value_start = key_start + usize::from(header.key_len);
        let key = &self.log[key_start..value_start];
        let value = &self.log[value_start..start + size];

        if !header.verify_crc(key, value) {
            return Err(ScanStop::Checksum);
        }
        let key = std::str::from_utf8(key).map_err(|_| ScanStop::BadKey)?;

        self.offset += size as u64;
        Ok(Some(LogRecord {
            offset: start as u64,
            key: key.to_string(),
            value: value.to_vec(),
        }))
    }
}

impl Iterator for LogCursor<'_> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        if self.stopped.is_some() {
            return None;
        }
        match self.read_next() {
            Ok(record) => record,
            Err(stop) => {
                self.stopped = Some(stop);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(log: &mut Vec<u8>, key: &str, value: &[u8]) {
        log.extend_from_slice(&RecordHeader::new(key.as_bytes(), value).to_bytes());
        log.extend_from_slice(key.as_bytes());
        log.extend_from_slice(value);
    }

    #[test]
    fn test_reads_records_in_order() {
        let mut log = Vec::new();
        append(&mut log, "Seq", &[1, 0, 0]);
        append(&mut log, "RPL/10", &[]);

        let mut cursor = LogCursor::new(&log, log.len() as u64);
        let first = cursor.next().unwrap();
        assert_eq!(first.key, "Seq");
        assert_eq!(first.offset, 0);
        let second = cursor.next().unwrap();
        assert!(second.is_tombstone());
        assert!(cursor.next().is_none());
        assert!(cursor.at_end());
        assert_eq!(cursor.stopped(), None);
    }

    #[test]
    fn test_stops_at_corrupt_record() {
        let mut log = Vec::new();
        append(&mut log, "Seq", &[1, 0, 0]);
        let good_end = log.len() as u64;
        append(&mut log, "IV", &[0; 5]);
        let last = log.len() - 1;
        log[last] ^= 0xff;

        let mut cursor = LogCursor::new(&log, log.len() as u64);
        assert_eq!(cursor.by_ref().count(), 1);
        assert_eq!(cursor.stopped(), Some(ScanStop::Checksum));
        assert_eq!(cursor.offset(), good_end);
    }

    #[test]
    fn test_truncated_payload() {
        let mut log = Vec::new();
        append(&mut log, "Net", &[0; 18]);

        let mut cursor = LogCursor::new(&log, (log.len() - 4) as u64);
        assert!(cursor.next().is_none());
        assert_eq!(cursor.stopped(), Some(ScanStop::Truncated));
        assert_eq!(cursor.offset(), 0);
    }
}
