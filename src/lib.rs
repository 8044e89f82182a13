//! Transactional record access over embedded key/value storage engines.
//!
//! The crate wraps a [`engine::StorageEngine`] backend with the access
//! discipline an embedded lock-managed engine needs but does not provide
//! on its own:
//!
//! * **Deadlock-aware retries.** Every record operation runs in its own
//!   transaction; when the engine's lock manager sacrifices the call, the
//!   transaction is rolled back and the operation replayed on a fresh one,
//!   up to a configured budget.
//! * **Buffer negotiation.** Caller memory is described once per call by a
//!   [`buffer::DataBuffer`] and carried across the engine boundary by a
//!   [`buffer::TransferSlot`], covering caller-allocated, engine-allocated
//!   and copy-on-demand transfers, with byte-window partial reads and
//!   writes.
//! * **Sentinel results.** Domain outcomes (missing, deleted, refused
//!   insert) come back as signed length sentinels instead of errors, so
//!   probing is cheap; everything else surfaces as a coded
//!   [`error::StoreError`].
//!
//! # Example
//!
//! ```
//! use stratakv::buffer::DataBuffer;
//! use stratakv::codes::{GetOpFlags, PutOpFlags};
//! use stratakv::config::StoreConfig;
//! use stratakv::engine::memory::MemoryEngine;
//! use stratakv::store::RecordStore;
//!
//! # fn main() -> stratakv::error::Result<()> {
//! let store = RecordStore::open(MemoryEngine::new(), StoreConfig::new("users"))?;
//!
//! let key = DataBuffer::bytes(b"alice");
//! let value = DataBuffer::bytes(b"record bytes");
//! store.put(&key, -1, -1, &value, PutOpFlags::NONE)?;
//!
//! let key = DataBuffer::bytes(b"alice");
//! let mut out = [0u8; 32];
//! let buffer = DataBuffer::bytes_mut(&mut out);
//! let size = store.get(&key, -1, &buffer, GetOpFlags::NONE)?;
//! assert_eq!(&out[..size as usize], b"record bytes");
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codes;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;

pub use buffer::{DataBuffer, StorageEntry, TransferSlot, ValueStream};
pub use codes::{CursorPosition, ReturnCode};
pub use config::{AccessMethod, StoreConfig};
pub use engine::StorageEngine;
pub use error::{Result, StoreError};
pub use store::{Cursor, Lengths, Presence, RecordStore};
