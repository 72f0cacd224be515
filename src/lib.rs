//! Mesh Settings - durable, debounced persistence of mesh configuration
//! state over a key-value store.
//!
//! # Overview
//!
//! A mesh node keeps its network identity, keys, replay list, model
//! configuration and more in memory while running. This crate persists that
//! state so it survives a reboot, without writing to flash on every change:
//!
//! 1. Protocol code mutates the shared [`MeshState`] and tells the engine what
//!    changed through a `store_*` or `clear_*` call
//! 2. The engine marks the change dirty and arms a debounce timer
//! 3. When the timer fires, a background worker serializes everything dirty
//!    and writes it to the [`Backend`] in one pass
//! 4. At boot, [`Settings::load`] reads every record back, checks the stored
//!    role and commits the configuration through the [`MeshStack`] hooks
//!
//! # Key Features
//!
//! - Fixed-layout, length-checked record encodings
//! - Coalescing of repeated changes to the same entity
//! - Three debounce classes, with identity changes flushed quickly
//! - Failed writes are retried by a later pass
//! - A memory-mapped, CRC-protected record log backend ([`FileStore`])
//!
//! # Usage
//!
//! ```no_run
//! use mesh_settings::{FileStore, MeshStack, MeshState, Role, Settings, StoreConfig};
//! use std::sync::Arc;
//!
//! struct Stack;
//!
//! impl MeshStack for Stack {
//!     fn app_id(&self, key: &[u8; 16]) -> u8 {
//!         key[0] & 0x3f
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::open("settings.dat", 64 * 1024)?;
//! let settings = Settings::new(
//!     store,
//!     MeshState::default(),
//!     Arc::new(Stack),
//!     StoreConfig::default(),
//! );
//! settings.init()?;
//! settings.load(Role::Node)?;
//! # Ok(())
//! # }
//! ```
//!
//! See the `demos` directory for a complete provisioning and reload cycle.

#![deny(missing_docs)]

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod pending;
pub mod scheduler;
pub mod stack;
pub mod state;
pub mod store;
pub mod table;

pub use codec::RecordKey;
pub use config::StoreConfig;
pub use engine::{FlushReport, LoadOutcome, Phase, Settings};
pub use error::{Result, SettingsError};
pub use stack::MeshStack;
pub use state::{MeshState, Model, ModelId, Role};
pub use store::{Backend, FileStore, MemoryStore};
