//! Error types shared across the settings engine.

use crate::state::Role;
use thiserror::Error;

/// A persisted record that could not be applied to the mesh state.
///
/// Decode errors are local to one record: the loader logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The value length does not match the fixed record layout.
    #[error("unexpected value length for {key}: expected {expected}, got {actual}")]
    Length {
        /// Record key
        key: String,
        /// Exact length the layout requires
        expected: usize,
        /// Length found in storage
        actual: usize,
    },

    /// The key does not follow the `<category>[/<hex-index>][/<attribute>]` grammar.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// No handler exists for the key's category.
    #[error("no matching handler for key {0}")]
    UnknownCategory(String),

    /// Model key names an attribute other than bind, sub, pub or data.
    #[error("unknown model attribute in key {0}")]
    UnknownAttribute(String),

    /// The composition has no model at the decoded element/model position.
    #[error("no model for element {elem_idx} index {mod_idx} (vendor: {vendor})")]
    UnknownModel {
        /// Vendor model flag
        vendor: bool,
        /// Element index
        elem_idx: u8,
        /// Model index within the element
        mod_idx: u8,
    },

    /// A publication record exists for a model without a publication context.
    #[error("model has no publication context: {0}")]
    NoPublication(String),

    /// The table that should hold the decoded entity is full.
    #[error("no space to restore {0}")]
    Exhausted(&'static str),

    /// The value is well sized but holds an invalid field.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Record key
        key: String,
        /// What was wrong
        reason: &'static str,
    },
}

/// Failures reported by a key-value backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An IO error occurred
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file is invalid or its control block is corrupted
    #[error("store is invalid or corrupted")]
    InvalidStore,

    /// A record does not fit in the store even after compaction
    #[error("record for {key} does not fit ({size} bytes)")]
    RecordTooLarge {
        /// Record key
        key: String,
        /// Encoded record size
        size: usize,
    },

    /// A backend refused the operation
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// A bounded table ran out of free slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{table} table exhausted (capacity {capacity})")]
pub struct Exhausted {
    /// Name of the table
    pub table: &'static str,
    /// Compile-time capacity of the table
    pub capacity: usize,
}

/// Errors surfaced by the settings engine.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The backend failed; the current load or flush pass was aborted.
    #[error(transparent)]
    Backend(#[from] StoreError),

    /// Persisted role differs from the role the caller expects to run as.
    #[error("role mismatch: expected {expected:?}, stored {stored:?}")]
    RoleMismatch {
        /// Role requested by the caller of `load`
        expected: Role,
        /// Role found in storage, if any
        stored: Option<Role>,
    },

    /// A bounded table is full.
    #[error(transparent)]
    ResourceExhausted(#[from] Exhausted),

    /// The entity was never created or persisted.
    #[error("{0} not found")]
    NotFound(String),

    /// A value handed to the engine could not be encoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SettingsError>;
