//! Positioned traversal over a record store.

use tracing::error;

use crate::buffer::{AllocTable, DataBuffer, TransferSlot, ValueStream};
use crate::codes::{CursorPosition, PutOpFlags, ReturnCode};
use crate::engine::StorageEngine;
use crate::error::{Result, StoreError};
use crate::store::{retry, Lengths, RecordStore};

/// Cursor over a record store.
///
/// Cursor calls run outside transaction scopes; a deadlocked call is
/// replayed in place, up to the store's retry budget. The cursor closes
/// its engine handle exactly once, either through [`Cursor::close`] or on
/// drop, and any further use fails with [`StoreError::CursorClosed`].
pub struct Cursor<'s, E: StorageEngine> {
    store: &'s RecordStore<E>,
    handle: Option<E::Cursor>,
}

impl<'s, E: StorageEngine> Cursor<'s, E> {
    pub(crate) fn new(store: &'s RecordStore<E>, handle: E::Cursor) -> Self {
        Self {
            store,
            handle: Some(handle),
        }
    }

    fn parts(&mut self) -> Result<(&'s RecordStore<E>, &mut E::Cursor)> {
        let store = self.store;
        if store.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        let handle = self.handle.as_mut().ok_or(StoreError::CursorClosed)?;
        Ok((store, handle))
    }

    /// Positions the cursor and reads the record there into caller
    /// buffers.
    ///
    /// `Set` reads `key` as the exact match to find; `SetRange` seeds the
    /// seek with the key buffer's contents and overwrites them with the
    /// matched key, so its key buffer must be writable; positional moves
    /// write the record's key into it. Returns the key and value sizes,
    /// or a sentinel pair: [`Lengths::NOT_FOUND`] when there is no record
    /// at the position, [`Lengths::DELETED`] when the position holds a
    /// deleted record.
    pub fn get(
        &mut self,
        position: CursorPosition,
        key: &DataBuffer<'_>,
        value: &DataBuffer<'_>,
    ) -> Result<Lengths> {
        let (store, handle) = self.parts()?;
        let mut key_slot = if position == CursorPosition::Set {
            TransferSlot::for_read(key)?
        } else {
            TransferSlot::for_write(key)?
        };
        let mut value_slot = TransferSlot::for_write(value)?;

        let code = retry::cursor_deadlock_loop(store.retry_budget(), "cursor get", || {
            store
                .engine()
                .cursor_get(handle, &mut key_slot, &mut value_slot, position, 0)
        })?;
        match code {
            ReturnCode::Success | ReturnCode::BufferSmall => {
                let key_len = if position == CursorPosition::Set {
                    key_slot.payload().map_or(0, <[u8]>::len)
                } else {
                    key_slot.found_size().unwrap_or(0)
                };
                Ok(Lengths {
                    key: key_len as i32,
                    value: value_slot.found_size().unwrap_or(0) as i32,
                })
            }
            ReturnCode::NotFound => Ok(Lengths::both(Lengths::NOT_FOUND)),
            ReturnCode::KeyEmpty => Ok(Lengths::both(Lengths::DELETED)),
            other => Err(StoreError::unexpected_code("cursor get", other)),
        }
    }

    /// Positions the cursor and reads the record there into owned
    /// buffers filled by the engine on demand. `None` when there is no
    /// record at the position.
    ///
    /// `SetRange` is not supported here: the matched key would have to be
    /// returned through an on-demand key buffer, which key-seeking
    /// positions cannot carry.
    pub fn get_owned(
        &mut self,
        position: CursorPosition,
        key: &DataBuffer<'_>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if position == CursorPosition::SetRange {
            return Err(StoreError::Unsupported(
                "SetRange cannot return its matched key through an on-demand buffer",
            ));
        }
        let (store, handle) = self.parts()?;
        let table = AllocTable::new();
        let mut key_slot = if position.reads_key() {
            TransferSlot::for_read(key)?
        } else {
            TransferSlot::copy_on_demand(&table)
        };
        let mut value_slot = TransferSlot::copy_on_demand(&table);

        let code = retry::cursor_deadlock_loop(store.retry_budget(), "cursor get", || {
            store
                .engine()
                .cursor_get(handle, &mut key_slot, &mut value_slot, position, 0)
        })?;
        match code {
            ReturnCode::Success => {
                let key_bytes = if position.reads_key() {
                    key_slot.payload().map(<[u8]>::to_vec).unwrap_or_default()
                } else {
                    key_slot.materialize_buffer()?
                };
                Ok(Some((key_bytes, value_slot.materialize_buffer()?)))
            }
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(None),
            other => Err(StoreError::unexpected_code("cursor get", other)),
        }
    }

    /// Positions the cursor and reads the record there, returning the key
    /// as owned bytes and the value as an engine-allocated stream. `None`
    /// when there is no record at the position.
    pub fn get_stream(
        &mut self,
        position: CursorPosition,
        key: &DataBuffer<'_>,
    ) -> Result<Option<(Vec<u8>, ValueStream)>> {
        if position == CursorPosition::SetRange {
            return Err(StoreError::Unsupported(
                "SetRange cannot return its matched key through an on-demand buffer",
            ));
        }
        let (store, handle) = self.parts()?;
        let table = AllocTable::new();
        let mut key_slot = if position.reads_key() {
            TransferSlot::for_read(key)?
        } else {
            TransferSlot::copy_on_demand(&table)
        };
        let mut value_slot = TransferSlot::engine_allocated(store.engine().alloc_hook());

        let code = retry::cursor_deadlock_loop(store.retry_budget(), "cursor get", || {
            store
                .engine()
                .cursor_get(handle, &mut key_slot, &mut value_slot, position, 0)
        })?;
        match code {
            ReturnCode::Success => {
                let key_bytes = if position.reads_key() {
                    key_slot.payload().map(<[u8]>::to_vec).unwrap_or_default()
                } else {
                    key_slot.materialize_buffer()?
                };
                match value_slot.materialize_stream() {
                    Some(stream) => Ok(Some((key_bytes, stream))),
                    None => Ok(None),
                }
            }
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(None),
            other => Err(StoreError::unexpected_code("cursor get", other)),
        }
    }

    /// Writes a record through the cursor.
    ///
    /// `Current` writes at the cursor's position and ignores `key`; the
    /// other positions key the write. `offset` and `count` window the
    /// write with the usual signed convention. Returns the written sizes,
    /// or [`Lengths::KEY_EXISTS`] when an exclusive insert was refused.
    pub fn put(
        &mut self,
        position: CursorPosition,
        key: &DataBuffer<'_>,
        offset: i32,
        count: i32,
        value: &DataBuffer<'_>,
        flags: PutOpFlags,
    ) -> Result<Lengths> {
        let (store, handle) = self.parts()?;
        let key_len = key.byte_length() as i32;
        let value_len = value.byte_length() as i32;
        let count = if count < 0 { value_len } else { count.min(value_len) };
        let mut key_slot = if position == CursorPosition::Current {
            None
        } else {
            Some(TransferSlot::for_read(key)?)
        };
        let mut value_slot = TransferSlot::for_read(value)?;
        if count < value_len {
            value_slot.limit_payload(count as usize);
        }
        if offset >= 0 {
            value_slot.set_partial(offset, count);
        }

        let code = retry::cursor_deadlock_loop(store.retry_budget(), "cursor put", || {
            store.engine().cursor_put(
                handle,
                key_slot.as_mut(),
                &mut value_slot,
                position,
                flags.bits(),
            )
        })?;
        match code {
            ReturnCode::Success => Ok(Lengths {
                key: key_len,
                value: count,
            }),
            ReturnCode::KeyExist => Ok(Lengths::both(Lengths::KEY_EXISTS)),
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(Lengths::both(Lengths::NOT_FOUND)),
            other => Err(StoreError::unexpected_code("cursor put", other)),
        }
    }

    /// Deletes the record at the cursor's position. `false` when the
    /// position holds no live record.
    pub fn delete(&mut self) -> Result<bool> {
        let (store, handle) = self.parts()?;
        let code = retry::cursor_deadlock_loop(store.retry_budget(), "cursor delete", || {
            store.engine().cursor_delete(handle, 0)
        })?;
        match code {
            ReturnCode::Success => Ok(true),
            ReturnCode::NotFound | ReturnCode::KeyEmpty => Ok(false),
            other => Err(StoreError::unexpected_code("cursor delete", other)),
        }
    }

    /// Closes the cursor's engine handle.
    ///
    /// Idempotent, and never fails: a close error is logged and dropped,
    /// because by the time a cursor closes the caller can do nothing
    /// about it. When the store itself is already closed the handle is
    /// simply discarded.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.store.is_closed() {
            return;
        }
        if let Err(err) = self.store.engine().cursor_close(handle) {
            error!(%err, "cursor close failed");
        }
    }
}

impl<E: StorageEngine> Drop for Cursor<'_, E> {
    fn drop(&mut self) {
        self.close();
    }
}
