//! In-memory storage engine.
//!
//! A sorted-map backend with single-writer transactions, used as the
//! default engine and as the test double for the retry and transaction
//! machinery. Fault injection lets tests script deadlocks and native
//! failures at exact call boundaries, and the operation counters make
//! attempt counts observable.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::buffer::{AllocHook, TransferSlot};
use crate::codes::{flags, CursorPosition, ReturnCode};
use crate::config::StoreConfig;
use crate::engine::{EngineError, EngineResult, StorageEngine};

type Records = BTreeMap<Vec<u8>, Bytes>;
/// Pending transaction writes. `None` marks a delete.
type Overlay = BTreeMap<Vec<u8>, Option<Bytes>>;

/// Scripted outcome for the next data call.
#[derive(Debug)]
pub enum Fault {
    /// Let the call proceed normally.
    Pass,
    /// Short-circuit the call with this return code.
    Code(ReturnCode),
    /// Fail the call with this native error.
    Error(EngineError),
}

/// Transaction and operation counters, for assertions in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnStats {
    /// Transactions begun.
    pub begun: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions aborted.
    pub aborted: usize,
}

#[derive(Debug, Default)]
struct EngineShared {
    records: RwLock<Records>,
    writer_gate: Arc<Mutex<()>>,
    hook: Arc<AllocHook>,
    faults: Mutex<VecDeque<Fault>>,
    data_ops: AtomicUsize,
    begun: AtomicUsize,
    committed: AtomicUsize,
    aborted: AtomicUsize,
    closed: AtomicBool,
}

/// Transaction handle for the in-memory engine.
///
/// Holds the writer gate for its whole lifetime, so at most one
/// transaction is in flight at a time and conflicting writers queue.
pub struct MemTxn {
    overlay: Arc<Mutex<Overlay>>,
    _gate: ArcMutexGuard<RawMutex, ()>,
}

/// Cursor handle for the in-memory engine.
pub struct MemCursor {
    overlay: Option<Arc<Mutex<Overlay>>>,
    current: Option<Vec<u8>>,
}

/// Sorted in-memory engine with single-writer transactions.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<EngineShared>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next data calls to fail with a deadlock, `n` times.
    pub fn inject_deadlocks(&self, n: usize) {
        let mut faults = self.inner.faults.lock();
        for _ in 0..n {
            faults.push_back(Fault::Code(ReturnCode::Deadlock));
        }
    }

    /// Scripts an arbitrary outcome for an upcoming data call.
    pub fn inject(&self, fault: Fault) {
        self.inner.faults.lock().push_back(fault);
    }

    /// Number of data calls attempted so far (faulted calls included).
    pub fn op_count(&self) -> usize {
        self.inner.data_ops.load(Ordering::Relaxed)
    }

    /// Transaction lifecycle counters.
    pub fn txn_stats(&self) -> TxnStats {
        TxnStats {
            begun: self.inner.begun.load(Ordering::Relaxed),
            committed: self.inner.committed.load(Ordering::Relaxed),
            aborted: self.inner.aborted.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of a record's committed bytes, for assertions.
    pub fn committed_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.records.read().get(key).map(|b| b.to_vec())
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::new(
                ReturnCode::RunRecovery.code(),
                "engine is closed",
            ));
        }
        Ok(())
    }

    /// Counts the call and applies any scripted fault.
    fn enter_data_op(&self) -> EngineResult<Option<ReturnCode>> {
        self.check_open()?;
        self.inner.data_ops.fetch_add(1, Ordering::Relaxed);
        match self.inner.faults.lock().pop_front() {
            None | Some(Fault::Pass) => Ok(None),
            Some(Fault::Code(code)) => Ok(Some(code)),
            Some(Fault::Error(err)) => Err(err),
        }
    }

    fn lookup(&self, overlay: Option<&Arc<Mutex<Overlay>>>, key: &[u8]) -> Option<Bytes> {
        if let Some(overlay) = overlay {
            if let Some(pending) = overlay.lock().get(key) {
                return pending.clone();
            }
        }
        self.inner.records.read().get(key).cloned()
    }

    fn write(&self, overlay: Option<&Arc<Mutex<Overlay>>>, key: Vec<u8>, value: Option<Bytes>) {
        match overlay {
            Some(overlay) => {
                overlay.lock().insert(key, value);
            }
            None => {
                let mut records = self.inner.records.write();
                match value {
                    Some(v) => {
                        records.insert(key, v);
                    }
                    None => {
                        records.remove(&key);
                    }
                }
            }
        }
    }

    /// Sorted keys visible to `overlay`, committed and pending merged.
    fn visible_keys(&self, overlay: Option<&Arc<Mutex<Overlay>>>) -> Vec<Vec<u8>> {
        let records = self.inner.records.read();
        match overlay {
            None => records.keys().cloned().collect(),
            Some(overlay) => {
                let overlay = overlay.lock();
                let mut merged: BTreeMap<&Vec<u8>, bool> =
                    records.keys().map(|k| (k, true)).collect();
                for (k, v) in overlay.iter() {
                    merged.insert(k, v.is_some());
                }
                merged
                    .into_iter()
                    .filter(|(_, live)| *live)
                    .map(|(k, _)| k.clone())
                    .collect()
            }
        }
    }

    fn key_bytes(slot: &TransferSlot<'_>) -> EngineResult<Vec<u8>> {
        slot.seek_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| EngineError::new(ReturnCode::PageNotFound.code(), "key slot not readable"))
    }

    /// Applies a put payload, honoring any partial window on the value
    /// slot: the payload lands at the window offset inside the existing
    /// record, zero-extending it when needed.
    fn compose_record(existing: Option<&Bytes>, value: &TransferSlot<'_>) -> EngineResult<Bytes> {
        let payload = value
            .payload()
            .ok_or_else(|| EngineError::new(ReturnCode::PageNotFound.code(), "value slot not readable"))?;
        Ok(match value.window_spec() {
            None => Bytes::copy_from_slice(payload),
            Some((offset, len)) => {
                let data = match len {
                    Some(n) => &payload[..n.min(payload.len())],
                    None => payload,
                };
                let mut record = existing.map(|b| b.to_vec()).unwrap_or_default();
                if record.len() < offset + data.len() {
                    record.resize(offset + data.len(), 0);
                }
                record[offset..offset + data.len()].copy_from_slice(data);
                Bytes::from(record)
            }
        })
    }

    fn cursor_overlay<'c>(cursor: &'c MemCursor) -> Option<&'c Arc<Mutex<Overlay>>> {
        cursor.overlay.as_ref()
    }

    fn seek(
        &self,
        cursor: &MemCursor,
        position: CursorPosition,
        sought: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        let keys = self.visible_keys(Self::cursor_overlay(cursor));
        match position {
            CursorPosition::Current => cursor.current.clone(),
            CursorPosition::First => keys.first().cloned(),
            CursorPosition::Last => keys.last().cloned(),
            CursorPosition::Next => match &cursor.current {
                None => keys.first().cloned(),
                Some(cur) => keys.iter().find(|k| *k > cur).cloned(),
            },
            CursorPosition::Previous => match &cursor.current {
                None => keys.last().cloned(),
                Some(cur) => keys.iter().rev().find(|k| *k < cur).cloned(),
            },
            CursorPosition::Set => {
                let sought = sought?;
                keys.iter().find(|k| k.as_slice() == sought).cloned()
            }
            CursorPosition::SetRange => {
                let sought = sought?;
                keys.iter().find(|k| k.as_slice() >= sought).cloned()
            }
            _ => None,
        }
    }
}

impl StorageEngine for MemoryEngine {
    type Txn = MemTxn;
    type Cursor = MemCursor;

    fn open(&self, config: &StoreConfig) -> EngineResult<()> {
        if config.name.is_empty() {
            return Err(EngineError::new(
                ReturnCode::PageNotFound.code(),
                "store name is empty",
            ));
        }
        self.inner.closed.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> EngineResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.records.write().clear();
        Ok(())
    }

    fn alloc_hook(&self) -> &Arc<AllocHook> {
        &self.inner.hook
    }

    fn txn_begin(&self) -> EngineResult<MemTxn> {
        self.check_open()?;
        let gate = self.inner.writer_gate.lock_arc();
        self.inner.begun.fetch_add(1, Ordering::Relaxed);
        Ok(MemTxn {
            overlay: Arc::new(Mutex::new(Overlay::new())),
            _gate: gate,
        })
    }

    fn txn_commit(&self, txn: MemTxn) -> EngineResult<()> {
        self.check_open()?;
        let mut records = self.inner.records.write();
        for (key, value) in std::mem::take(&mut *txn.overlay.lock()) {
            match value {
                Some(v) => {
                    records.insert(key, v);
                }
                None => {
                    records.remove(&key);
                }
            }
        }
        self.inner.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn txn_abort(&self, txn: MemTxn) -> EngineResult<()> {
        drop(txn);
        self.inner.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get(
        &self,
        txn: Option<&MemTxn>,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        _flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let key_bytes = Self::key_bytes(key)?;
        match self.lookup(txn.map(|t| &t.overlay), &key_bytes) {
            None => Ok(ReturnCode::NotFound),
            Some(stored) => Ok(value.deliver(&stored)),
        }
    }

    fn put(
        &self,
        txn: Option<&MemTxn>,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let key_bytes = Self::key_bytes(key)?;
        let overlay = txn.map(|t| &t.overlay);
        let existing = self.lookup(overlay, &key_bytes);
        if flags & flags::NO_OVERWRITE != 0 && existing.is_some() {
            return Ok(ReturnCode::KeyExist);
        }
        let record = Self::compose_record(existing.as_ref(), value)?;
        self.write(overlay, key_bytes, Some(record));
        Ok(ReturnCode::Success)
    }

    fn delete(
        &self,
        txn: Option<&MemTxn>,
        key: &mut TransferSlot<'_>,
        _flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let key_bytes = Self::key_bytes(key)?;
        let overlay = txn.map(|t| &t.overlay);
        if self.lookup(overlay, &key_bytes).is_none() {
            return Ok(ReturnCode::NotFound);
        }
        self.write(overlay, key_bytes, None);
        Ok(ReturnCode::Success)
    }

    fn exists(
        &self,
        txn: Option<&MemTxn>,
        key: &mut TransferSlot<'_>,
        _flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let key_bytes = Self::key_bytes(key)?;
        match self.lookup(txn.map(|t| &t.overlay), &key_bytes) {
            Some(_) => Ok(ReturnCode::Success),
            None => Ok(ReturnCode::NotFound),
        }
    }

    fn cursor_open(&self, txn: Option<&MemTxn>, _flags: u32) -> EngineResult<MemCursor> {
        self.check_open()?;
        Ok(MemCursor {
            overlay: txn.map(|t| Arc::clone(&t.overlay)),
            current: None,
        })
    }

    fn cursor_close(&self, cursor: MemCursor) -> EngineResult<()> {
        drop(cursor);
        Ok(())
    }

    fn cursor_get(
        &self,
        cursor: &mut MemCursor,
        key: &mut TransferSlot<'_>,
        value: &mut TransferSlot<'_>,
        position: CursorPosition,
        _flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let sought = if position.reads_key() {
            Some(Self::key_bytes(key)?)
        } else {
            None
        };
        let found = match self.seek(cursor, position, sought.as_deref()) {
            Some(k) => k,
            None => {
                return Ok(if position == CursorPosition::Current && cursor.current.is_some() {
                    ReturnCode::KeyEmpty
                } else {
                    ReturnCode::NotFound
                })
            }
        };
        let stored = match self.lookup(Self::cursor_overlay(cursor), &found) {
            Some(s) => s,
            // The cursor's record was deleted out from under it.
            None => return Ok(ReturnCode::KeyEmpty),
        };
        cursor.current = Some(found.clone());
        let mut small = false;
        // Exact-match seeks already hold the key; every other position
        // (range seeks included) reports the matched key back.
        if position != CursorPosition::Set {
            small |= key.deliver(&found) == ReturnCode::BufferSmall;
        }
        small |= value.deliver(&stored) == ReturnCode::BufferSmall;
        Ok(if small {
            ReturnCode::BufferSmall
        } else {
            ReturnCode::Success
        })
    }

    fn cursor_put(
        &self,
        cursor: &mut MemCursor,
        key: Option<&mut TransferSlot<'_>>,
        value: &mut TransferSlot<'_>,
        position: CursorPosition,
        flags: u32,
    ) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let target = match position {
            CursorPosition::Current => match cursor.current.clone() {
                Some(k) => k,
                None => return Ok(ReturnCode::KeyEmpty),
            },
            _ => match key {
                Some(slot) => Self::key_bytes(slot)?,
                None => return Ok(ReturnCode::KeyEmpty),
            },
        };
        let overlay = cursor.overlay.clone();
        let existing = self.lookup(overlay.as_ref(), &target);
        if flags & flags::NO_OVERWRITE != 0 && existing.is_some() {
            return Ok(ReturnCode::KeyExist);
        }
        let record = Self::compose_record(existing.as_ref(), value)?;
        self.write(overlay.as_ref(), target.clone(), Some(record));
        cursor.current = Some(target);
        Ok(ReturnCode::Success)
    }

    fn cursor_delete(&self, cursor: &mut MemCursor, _flags: u32) -> EngineResult<ReturnCode> {
        if let Some(code) = self.enter_data_op()? {
            return Ok(code);
        }
        let target = match cursor.current.clone() {
            Some(k) => k,
            None => return Ok(ReturnCode::KeyEmpty),
        };
        let overlay = cursor.overlay.clone();
        if self.lookup(overlay.as_ref(), &target).is_none() {
            return Ok(ReturnCode::KeyEmpty);
        }
        self.write(overlay.as_ref(), target, None);
        Ok(ReturnCode::Success)
    }

    fn sync(&self) -> EngineResult<()> {
        self.check_open()
    }

    fn truncate(&self) -> EngineResult<u32> {
        self.check_open()?;
        let mut records = self.inner.records.write();
        let n = records.len() as u32;
        records.clear();
        Ok(n)
    }

    fn compact(&self, _fill_percent: u32, _max_pages: u32) -> EngineResult<u32> {
        self.check_open()?;
        Ok(0)
    }

    fn key_count(&self, _flags: u32) -> EngineResult<u64> {
        self.check_open()?;
        Ok(self.inner.records.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DataBuffer;

    fn read_slot<'a>(buf: &'a DataBuffer<'_>) -> TransferSlot<'a> {
        TransferSlot::for_read(buf).unwrap()
    }

    fn put(engine: &MemoryEngine, txn: Option<&MemTxn>, key: &[u8], value: &[u8]) -> ReturnCode {
        let kb = DataBuffer::bytes(key);
        let vb = DataBuffer::bytes(value);
        let mut ks = read_slot(&kb);
        let mut vs = read_slot(&vb);
        engine.put(txn, &mut ks, &mut vs, 0).unwrap()
    }

    fn opened() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.open(&StoreConfig::new("t")).unwrap();
        engine
    }

    #[test]
    fn put_get_round_trip() {
        let engine = opened();
        assert_eq!(put(&engine, None, b"k", b"value"), ReturnCode::Success);

        let kb = DataBuffer::bytes(b"k");
        let mut out = [0u8; 16];
        let vb = DataBuffer::bytes_mut(&mut out);
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        assert_eq!(engine.get(None, &mut ks, &mut vs, 0).unwrap(), ReturnCode::Success);
        assert_eq!(vs.found_size(), Some(5));
    }

    #[test]
    fn missing_key_is_not_found() {
        let engine = opened();
        let kb = DataBuffer::bytes(b"absent");
        let vb = DataBuffer::empty();
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        assert_eq!(engine.get(None, &mut ks, &mut vs, 0).unwrap(), ReturnCode::NotFound);
    }

    #[test]
    fn transaction_isolation_and_commit() {
        let engine = opened();
        let txn = engine.txn_begin().unwrap();
        assert_eq!(put(&engine, Some(&txn), b"k", b"v"), ReturnCode::Success);
        assert!(engine.committed_value(b"k").is_none());
        engine.txn_commit(txn).unwrap();
        assert_eq!(engine.committed_value(b"k").unwrap(), b"v");
        assert_eq!(engine.txn_stats(), TxnStats { begun: 1, committed: 1, aborted: 0 });
    }

    #[test]
    fn abort_discards_writes() {
        let engine = opened();
        let txn = engine.txn_begin().unwrap();
        put(&engine, Some(&txn), b"k", b"v");
        engine.txn_abort(txn).unwrap();
        assert!(engine.committed_value(b"k").is_none());
    }

    #[test]
    fn no_overwrite_reports_key_exist() {
        let engine = opened();
        put(&engine, None, b"k", b"v1");
        let kb = DataBuffer::bytes(b"k");
        let vb = DataBuffer::bytes(b"v2");
        let mut ks = read_slot(&kb);
        let mut vs = read_slot(&vb);
        assert_eq!(
            engine.put(None, &mut ks, &mut vs, flags::NO_OVERWRITE).unwrap(),
            ReturnCode::KeyExist
        );
        assert_eq!(engine.committed_value(b"k").unwrap(), b"v1");
    }

    #[test]
    fn partial_put_extends_with_zero_fill() {
        let engine = opened();
        put(&engine, None, b"k", b"ab");
        let kb = DataBuffer::bytes(b"k");
        let vb = DataBuffer::bytes(b"XY");
        let mut ks = read_slot(&kb);
        let mut vs = read_slot(&vb);
        vs.set_partial(4, 2);
        engine.put(None, &mut ks, &mut vs, 0).unwrap();
        assert_eq!(engine.committed_value(b"k").unwrap(), b"ab\0\0XY");
    }

    #[test]
    fn injected_deadlock_fires_once() {
        let engine = opened();
        engine.inject_deadlocks(1);
        let kb = DataBuffer::bytes(b"k");
        let vb = DataBuffer::empty();
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        assert_eq!(engine.get(None, &mut ks, &mut vs, 0).unwrap(), ReturnCode::Deadlock);

        let kb = DataBuffer::bytes(b"k");
        let vb = DataBuffer::empty();
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        assert_eq!(engine.get(None, &mut ks, &mut vs, 0).unwrap(), ReturnCode::NotFound);
        assert_eq!(engine.op_count(), 2);
    }

    #[test]
    fn cursor_walks_in_key_order() {
        let engine = opened();
        put(&engine, None, b"b", b"2");
        put(&engine, None, b"a", b"1");
        put(&engine, None, b"c", b"3");

        let mut cursor = engine.cursor_open(None, 0).unwrap();
        let mut seen = Vec::new();
        let mut position = CursorPosition::First;
        loop {
            let mut key_out = [0u8; 8];
            let mut val_out = [0u8; 8];
            let kb = DataBuffer::bytes_mut(&mut key_out);
            let vb = DataBuffer::bytes_mut(&mut val_out);
            let mut ks = TransferSlot::for_write(&kb).unwrap();
            let mut vs = TransferSlot::for_write(&vb).unwrap();
            match engine.cursor_get(&mut cursor, &mut ks, &mut vs, position, 0).unwrap() {
                ReturnCode::Success => {
                    let klen = ks.found_size().unwrap();
                    drop(ks);
                    drop(vs);
                    seen.push(key_out[..klen].to_vec());
                }
                ReturnCode::NotFound => break,
                other => panic!("unexpected code {other:?}"),
            }
            position = CursorPosition::Next;
        }
        engine.cursor_close(cursor).unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn set_range_finds_following_key() {
        let engine = opened();
        put(&engine, None, b"apple", b"1");
        put(&engine, None, b"cherry", b"2");

        let mut cursor = engine.cursor_open(None, 0).unwrap();
        let kb = DataBuffer::bytes(b"banana");
        let vb = DataBuffer::empty();
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        let code = engine
            .cursor_get(&mut cursor, &mut ks, &mut vs, CursorPosition::SetRange, 0)
            .unwrap();
        assert!(matches!(code, ReturnCode::Success | ReturnCode::BufferSmall));
        assert_eq!(cursor.current.as_deref(), Some(b"cherry".as_slice()));
        engine.cursor_close(cursor).unwrap();
    }

    #[test]
    fn cursor_delete_then_current_reports_key_empty() {
        let engine = opened();
        put(&engine, None, b"k", b"v");
        let mut cursor = engine.cursor_open(None, 0).unwrap();

        let kb = DataBuffer::bytes(b"k");
        let vb = DataBuffer::empty();
        let mut ks = read_slot(&kb);
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        engine
            .cursor_get(&mut cursor, &mut ks, &mut vs, CursorPosition::Set, 0)
            .unwrap();
        assert_eq!(engine.cursor_delete(&mut cursor, 0).unwrap(), ReturnCode::Success);

        let kb = DataBuffer::empty();
        let vb = DataBuffer::empty();
        let mut ks = TransferSlot::for_write(&kb).unwrap();
        let mut vs = TransferSlot::for_write(&vb).unwrap();
        assert_eq!(
            engine
                .cursor_get(&mut cursor, &mut ks, &mut vs, CursorPosition::Current, 0)
                .unwrap(),
            ReturnCode::KeyEmpty
        );
    }

    #[test]
    fn truncate_reports_discarded_count() {
        let engine = opened();
        put(&engine, None, b"a", b"1");
        put(&engine, None, b"b", b"2");
        assert_eq!(engine.truncate().unwrap(), 2);
        assert_eq!(engine.key_count(0).unwrap(), 0);
    }
}
