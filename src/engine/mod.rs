//! Storage engine abstraction.
//!
//! The record store talks to its backend exclusively through
//! [`StorageEngine`]. Domain outcomes (not found, buffer small, deadlock)
//! travel as [`ReturnCode`] values; anything the engine cannot express as a
//! return code fails the call with an [`EngineError`].

pub mod memory;

use std::sync::Arc;

use thiserror::Error;

use crate::buffer::{AllocHook, TransferSlot};
use crate::codes::{CursorPosition, ReturnCode};
use crate::config::StoreConfig;

/// Native engine failure: a raw code plus the engine's own text.
#[derive(Debug, Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    /// Raw engine code.
    pub code: i32,
    /// Engine-provided failure text.
    pub message: String,
}

impl EngineError {
    /// Builds a failure from a raw code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether this failure is a lock-manager conflict the retry engine
    /// should absorb instead of surfacing.
    pub fn is_deadlock(&self) -> bool {
        self.code == ReturnCode::Deadlock.code()
    }
}

/// Result alias for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Backend contract for record and cursor operations.
///
/// Record calls take an optional transaction handle: `None` means the call
/// runs untransacted (autocommit for writes). All buffer traffic flows
/// through [`TransferSlot`]s so the engine never sees caller memory
/// directly.
pub trait StorageEngine: Send + Sync {
    /// Engine transaction handle.
    type Txn;
    /// Engine cursor handle.
    type Cursor;

    /// Opens the backing store described by `config`.
    fn open(&self, config: &StoreConfig) -> EngineResult<()>;

    /// Closes the backing store. Idempotent.
    fn close(&self) -> EngineResult<()>;

    /// Allocation hook engine-allocated transfers are granted through.
    fn alloc_hook(&self) -> &Arc<AllocHook>;

    /// Begins a transaction.
    fn txn_begin(&self) -> EngineResult<Self::Txn>;
    /// Commits a transaction.
    fn txn_commit(&self, txn: Self::Txn) -> EngineResult<()>;
    /// Aborts a transaction, releasing its locks.
    fn txn_abort(&self, txn: Self::Txn) -> EngineResult<()>;

    /// Reads the record for `key` into `value`.
    fn get(
        &self,
        txn: Option<&Self::Txn>,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Writes the record for `key` from `value`.
    fn put(
        &self,
        txn: Option<&Self::Txn>,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Deletes the record for `key`.
    fn delete(
        &self,
        txn: Option<&Self::Txn>,
        key: &mut TransferSlot<'_>,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Probes for the record for `key` without transferring it.
    fn exists(
        &self,
        txn: Option<&Self::Txn>,
        key: &mut TransferSlot<'_>,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Opens a cursor, optionally inside a transaction.
    fn cursor_open(&self, txn: Option<&Self::Txn>, flags: u32) -> EngineResult<Self::Cursor>;

    /// Closes a cursor.
    fn cursor_close(&self, cursor: Self::Cursor) -> EngineResult<()>;

    /// Positions the cursor and reads the record there.
    fn cursor_get(
        &self,
        cursor: &mut Self::Cursor,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        position: CursorPosition,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Writes a record through the cursor. `key` is `None` for positions
    /// that write at the cursor's current location.
    fn cursor_put(
        &self,
        cursor: &mut Self::Cursor,
        key: Option<&mut TransferSlot<'_>>,
        value: &mut TransferSlot<'_>,
        position: CursorPosition,
        flags: u32,
    ) -> EngineResult<ReturnCode>;

    /// Deletes the record at the cursor's current position.
    fn cursor_delete(&self, cursor: &mut Self::Cursor, flags: u32) -> EngineResult<ReturnCode>;

    /// Flushes dirty pages to stable storage.
    fn sync(&self) -> EngineResult<()>;

    /// Removes every record, returning how many were discarded.
    fn truncate(&self) -> EngineResult<u32>;

    /// Compacts the store, returning how many pages were freed.
    fn compact(&self, fill_percent: u32, max_pages: u32) -> EngineResult<u32>;

    /// Number of keys in the store.
    fn key_count(&self, flags: u32) -> EngineResult<u64>;
}
