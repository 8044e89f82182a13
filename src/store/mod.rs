//! Record store: the transactional access surface over a storage engine.

pub mod cursor;
pub(crate) mod retry;
pub mod scope;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::buffer::{AllocTable, DataBuffer, StorageEntry, TransferSlot, ValueStream};
use crate::codes::{
    flags, CursorPosition, DeleteOpFlags, ExistsOpFlags, GetOpFlags, PutOpFlags, ReturnCode,
};
use crate::config::StoreConfig;
use crate::engine::StorageEngine;
use crate::error::{Result, StoreError};

pub use cursor::Cursor;
pub use scope::TransactionScope;

/// Signed length sentinels returned where a record size is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    /// Size of the record's key, or a sentinel.
    pub key: i32,
    /// Size of the record's value, or a sentinel.
    pub value: i32,
}

impl Lengths {
    /// No record exists for the key.
    pub const NOT_FOUND: i32 = -1;
    /// The key exists but its record was deleted or never populated.
    pub const DELETED: i32 = -2;
    /// An exclusive insert was refused because the key already exists.
    pub const KEY_EXISTS: i32 = -3;

    pub(crate) fn both(v: i32) -> Self {
        Self { key: v, value: v }
    }
}

/// Outcome of an existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// A live record exists for the key.
    Found,
    /// No record exists for the key.
    NotFound,
    /// The key exists but its record was deleted or never populated.
    Deleted,
}

enum RmwOutcome {
    Done(i32),
    Deadlocked,
    /// An exclusive insert lost to a racing writer; replay the whole
    /// read-modify-write without consuming retry budget.
    InsertRaced,
}

/// Handle to one open record store.
///
/// All record operations are deadlock-aware: each runs in its own
/// transaction scope (when the store is transactional) and is replayed on
/// a fresh transaction when the engine's lock manager sacrifices it, up to
/// the configured retry budget.
pub struct RecordStore<E: StorageEngine> {
    engine: E,
    config: StoreConfig,
    retry_budget: u32,
    closed: AtomicBool,
}

impl<E: StorageEngine> RecordStore<E> {
    /// Opens a store on `engine` as described by `config`.
    pub fn open(engine: E, config: StoreConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(StoreError::InvalidConfig("store name is empty".into()));
        }
        if config.read_only && config.create {
            return Err(StoreError::InvalidConfig(
                "read_only and create are mutually exclusive".into(),
            ));
        }
        engine
            .open(&config)
            .map_err(|e| StoreError::engine("open", e))?;
        info!(
            name = %config.name,
            transactional = config.transactional,
            retries = config.effective_retry_budget(),
            "record store opened"
        );
        Ok(Self {
            retry_budget: config.effective_retry_budget(),
            engine,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Borrow of the underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub(crate) fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        Ok(())
    }

    fn validate_key(method: &'static str, key: &DataBuffer<'_>) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::KeyZeroLength { method });
        }
        Ok(())
    }

    fn scope(&self) -> TransactionScope<'_, E> {
        TransactionScope::new(&self.engine, self.config.transactional)
    }

    /// Reads the record for `key` into `buffer`.
    ///
    /// Returns the size of the stored value (windowed when `offset` is
    /// non-negative), or [`Lengths::NOT_FOUND`]. When `buffer` is smaller
    /// than the value, the prefix that fits is copied and the true size is
    /// still returned; an empty `buffer` therefore acts as a pure size
    /// probe.
    pub fn get(
        &self,
        key: &DataBuffer<'_>,
        offset: i32,
        buffer: &DataBuffer<'_>,
        flags: GetOpFlags,
    ) -> Result<i32> {
        self.ensure_open()?;
        Self::validate_key("get", key)?;
        let capacity = buffer.byte_length() as i32;
        let mut key_slot = TransferSlot::for_read(key)?;
        let mut value_slot = TransferSlot::for_write(buffer)?;
        value_slot.set_partial(offset, capacity);

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "get", |txn| {
            self.engine.get(txn, &mut key_slot, &mut value_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success | ReturnCode::BufferSmall => {
                Ok(value_slot.found_size().unwrap_or(0) as i32)
            }
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(Lengths::NOT_FOUND),
            other => Err(StoreError::unexpected_code("get", other)),
        }
    }

    /// Size of the stored value for `key`, or [`Lengths::NOT_FOUND`].
    pub fn get_length(&self, key: &DataBuffer<'_>, flags: GetOpFlags) -> Result<i32> {
        let probe = DataBuffer::empty();
        self.get(key, -1, &probe, flags)
    }

    /// Reads the record for `key` into an engine-allocated stream.
    ///
    /// `offset` and `length` window the stored value with the usual signed
    /// convention. `None` when no record exists.
    pub fn get_stream(
        &self,
        key: &DataBuffer<'_>,
        offset: i32,
        length: i32,
        flags: GetOpFlags,
    ) -> Result<Option<ValueStream>> {
        self.ensure_open()?;
        Self::validate_key("get", key)?;
        let mut key_slot = TransferSlot::for_read(key)?;
        let mut value_slot = TransferSlot::engine_allocated(self.engine.alloc_hook());
        value_slot.set_partial(offset, length);

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "get", |txn| {
            self.engine.get(txn, &mut key_slot, &mut value_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success => Ok(value_slot.materialize_stream()),
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(None),
            other => Err(StoreError::unexpected_code("get", other)),
        }
    }

    /// Reads the record for `key` into a buffer the engine fills on
    /// demand. `None` when no record exists.
    pub fn get_buffer(
        &self,
        key: &DataBuffer<'_>,
        offset: i32,
        length: i32,
        flags: GetOpFlags,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Self::validate_key("get", key)?;
        let table = AllocTable::new();
        let mut key_slot = TransferSlot::for_read(key)?;
        let mut value_slot = TransferSlot::copy_on_demand(&table);
        value_slot.set_partial(offset, length);

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "get", |txn| {
            self.engine.get(txn, &mut key_slot, &mut value_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success => Ok(Some(value_slot.materialize_buffer()?)),
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(None),
            other => Err(StoreError::unexpected_code("get", other)),
        }
    }

    /// Writes `buffer` as the record for `key`.
    ///
    /// A non-negative `offset` writes into the stored value at that
    /// position, zero-extending it when needed; `count` limits how many
    /// buffer bytes are written, with a negative count meaning all of
    /// them. Returns the number of bytes written, or
    /// [`Lengths::KEY_EXISTS`] when an exclusive insert was refused.
    pub fn put(
        &self,
        key: &DataBuffer<'_>,
        offset: i32,
        count: i32,
        buffer: &DataBuffer<'_>,
        flags: PutOpFlags,
    ) -> Result<i32> {
        self.ensure_open()?;
        Self::validate_key("put", key)?;
        let len = buffer.byte_length() as i32;
        let count = if count < 0 { len } else { count.min(len) };
        let mut key_slot = TransferSlot::for_read(key)?;
        let mut value_slot = TransferSlot::for_read(buffer)?;
        if count < len {
            value_slot.limit_payload(count as usize);
        }
        if offset >= 0 {
            value_slot.set_partial(offset, count);
        }

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "put", |txn| {
            self.engine.put(txn, &mut key_slot, &mut value_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success => Ok(count),
            ReturnCode::NotFound => Ok(Lengths::NOT_FOUND),
            ReturnCode::KeyExist => Ok(Lengths::KEY_EXISTS),
            other => Err(StoreError::unexpected_code("put", other)),
        }
    }

    /// Deletes the record for `key`. `false` when no record existed.
    pub fn delete(&self, key: &DataBuffer<'_>, flags: DeleteOpFlags) -> Result<bool> {
        self.ensure_open()?;
        Self::validate_key("delete", key)?;
        let mut key_slot = TransferSlot::for_read(key)?;

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "delete", |txn| {
            self.engine.delete(txn, &mut key_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success => Ok(true),
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(false),
            other => Err(StoreError::unexpected_code("delete", other)),
        }
    }

    /// Probes whether a record exists for `key` without transferring it.
    pub fn exists(&self, key: &DataBuffer<'_>, flags: ExistsOpFlags) -> Result<Presence> {
        self.ensure_open()?;
        Self::validate_key("exists", key)?;
        let mut key_slot = TransferSlot::for_read(key)?;

        let mut scope = self.scope();
        let code = retry::deadlock_loop(&mut scope, self.retry_budget, "exists", |txn| {
            self.engine.exists(txn, &mut key_slot, flags.bits())
        })?;
        scope.commit()?;
        match code {
            ReturnCode::Success => Ok(Presence::Found),
            ReturnCode::NotFound => Ok(Presence::NotFound),
            ReturnCode::KeyEmpty => Ok(Presence::Deleted),
            other => Err(StoreError::unexpected_code("exists", other)),
        }
    }

    /// Read-modify-write for the record at `key`.
    ///
    /// Fetches the current record under a write lock into `entry`,
    /// applies `transform`, then writes the entry's live window back
    /// through the same cursor. A missing record arrives as an entry with
    /// `length == 0`; leaving the length at zero makes the operation a
    /// no-op, and zeroing the length of a fetched record deletes it.
    ///
    /// Returns the number of bytes written, [`Lengths::DELETED`] after a
    /// delete, or [`Lengths::NOT_FOUND`] after a no-op.
    pub fn update<F>(
        &self,
        key: &DataBuffer<'_>,
        entry: &mut StorageEntry,
        mut transform: F,
    ) -> Result<i32>
    where
        F: FnMut(&mut StorageEntry),
    {
        self.ensure_open()?;
        Self::validate_key("update", key)?;
        let mut key_slot = TransferSlot::for_read(key)?;

        let mut scope = self.scope();
        let mut retries = 0u32;
        loop {
            let outcome = {
                let txn = scope.begin()?;
                self.update_once(txn, &mut key_slot, entry, &mut transform)
            };
            match outcome {
                Ok(RmwOutcome::Done(len)) => {
                    scope.commit()?;
                    return Ok(len);
                }
                Ok(RmwOutcome::Deadlocked) => {
                    scope.rollback()?;
                    retries += 1;
                    if retries >= self.retry_budget {
                        error!(
                            method = "update",
                            retries, "deadlock retry budget exhausted, giving up"
                        );
                        return Err(StoreError::DeadlockRetriesExhausted {
                            method: "update",
                            retries,
                        });
                    }
                    warn!(method = "update", retry = retries, "deadlock detected, retrying");
                }
                Ok(RmwOutcome::InsertRaced) => {
                    scope.rollback()?;
                    warn!(method = "update", "exclusive insert raced, replaying");
                }
                Err(err) => {
                    if let Err(rollback) = scope.rollback() {
                        error!(%rollback, "rollback after failed update also failed");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One attempt of [`RecordStore::update`], with the cursor closed on
    /// every exit path.
    fn update_once<F>(
        &self,
        txn: Option<&E::Txn>,
        key_slot: &mut TransferSlot<'_>,
        entry: &mut StorageEntry,
        transform: &mut F,
    ) -> Result<RmwOutcome>
    where
        F: FnMut(&mut StorageEntry),
    {
        let mut cursor = match self.engine.cursor_open(txn, flags::WRITE_CURSOR) {
            Ok(cursor) => cursor,
            Err(err) if err.is_deadlock() => return Ok(RmwOutcome::Deadlocked),
            Err(err) => return Err(StoreError::engine("update", err)),
        };
        let outcome = self.update_under_cursor(txn, &mut cursor, key_slot, entry, transform);
        if let Err(err) = self.engine.cursor_close(cursor) {
            warn!(%err, "cursor close after update failed");
        }
        outcome
    }

    fn update_under_cursor<F>(
        &self,
        txn: Option<&E::Txn>,
        cursor: &mut E::Cursor,
        key_slot: &mut TransferSlot<'_>,
        entry: &mut StorageEntry,
        transform: &mut F,
    ) -> Result<RmwOutcome>
    where
        F: FnMut(&mut StorageEntry),
    {
        let table = AllocTable::new();
        let mut fetch_slot = TransferSlot::copy_on_demand(&table);
        let code = match self.engine.cursor_get(
            cursor,
            key_slot,
            &mut fetch_slot,
            CursorPosition::Set,
            flags::RMW,
        ) {
            Ok(code) => code,
            Err(err) if err.is_deadlock() => return Ok(RmwOutcome::Deadlocked),
            Err(err) => return Err(StoreError::engine("update", err)),
        };
        let found = match code {
            ReturnCode::Success => {
                let bytes = fetch_slot.materialize_buffer()?;
                entry.start = 0;
                entry.length = bytes.len();
                entry.buffer = bytes;
                true
            }
            ReturnCode::NotFound | ReturnCode::KeyEmpty => {
                entry.length = 0;
                false
            }
            ReturnCode::Deadlock => return Ok(RmwOutcome::Deadlocked),
            other => return Err(StoreError::unexpected_code("update", other)),
        };

        transform(entry);

        if entry.length == 0 {
            if !found {
                return Ok(RmwOutcome::Done(Lengths::NOT_FOUND));
            }
            return match self.engine.cursor_delete(cursor, 0) {
                Ok(ReturnCode::Success | ReturnCode::NotFound | ReturnCode::KeyEmpty) => {
                    Ok(RmwOutcome::Done(Lengths::DELETED))
                }
                Ok(ReturnCode::Deadlock) => Ok(RmwOutcome::Deadlocked),
                Ok(other) => Err(StoreError::unexpected_code("update", other)),
                Err(err) if err.is_deadlock() => Ok(RmwOutcome::Deadlocked),
                Err(err) => Err(StoreError::engine("update", err)),
            };
        }

        let written = entry.window().len() as i32;
        let value = DataBuffer::bytes(entry.window());
        let mut value_slot = TransferSlot::for_read(&value)?;
        let result = if found {
            self.engine
                .cursor_put(cursor, None, &mut value_slot, CursorPosition::Current, 0)
        } else {
            // A record that was absent under the write lock is inserted
            // exclusively, so a concurrent insert surfaces as KeyExist
            // instead of being silently overwritten.
            self.engine
                .put(txn, key_slot, &mut value_slot, flags::NO_OVERWRITE)
        };
        match result {
            Ok(ReturnCode::Success) => Ok(RmwOutcome::Done(written)),
            Ok(ReturnCode::KeyExist) => Ok(RmwOutcome::InsertRaced),
            Ok(ReturnCode::Deadlock) => Ok(RmwOutcome::Deadlocked),
            Ok(other) => Err(StoreError::unexpected_code("update", other)),
            Err(err) if err.is_deadlock() => Ok(RmwOutcome::Deadlocked),
            Err(err) => Err(StoreError::engine("update", err)),
        }
    }

    /// Opens a cursor over the store.
    ///
    /// Cursors run outside transaction scopes; their deadlock retries
    /// replay the single positioned call.
    pub fn cursor(&self) -> Result<Cursor<'_, E>> {
        self.ensure_open()?;
        let open_flags = if self.config.read_only {
            0
        } else {
            flags::WRITE_CURSOR
        };
        let handle = self
            .engine
            .cursor_open(None, open_flags)
            .map_err(|e| StoreError::engine("cursor open", e))?;
        Ok(Cursor::new(self, handle))
    }

    /// Flushes dirty pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.engine.sync().map_err(|e| StoreError::engine("sync", e))
    }

    /// Removes every record, returning how many were discarded.
    pub fn truncate(&self) -> Result<u32> {
        self.ensure_open()?;
        self.engine
            .truncate()
            .map_err(|e| StoreError::engine("truncate", e))
    }

    /// Compacts the store, returning how many pages were freed.
    pub fn compact(&self, fill_percent: u32, max_pages: u32) -> Result<u32> {
        self.ensure_open()?;
        self.engine
            .compact(fill_percent, max_pages)
            .map_err(|e| StoreError::engine("compact", e))
    }

    /// Number of keys in the store.
    pub fn key_count(&self) -> Result<u64> {
        self.ensure_open()?;
        self.engine
            .key_count(0)
            .map_err(|e| StoreError::engine("key count", e))
    }

    /// Closes the store. Idempotent; operations after close fail with
    /// [`StoreError::StoreClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.config.name, "record store closed");
        self.engine
            .close()
            .map_err(|e| StoreError::engine("close", e))
    }
}

impl<E: StorageEngine> Drop for RecordStore<E> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(%err, "store close on drop failed");
        }
    }
}
