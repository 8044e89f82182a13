//! Engine-side allocation plumbing.
//!
//! Two ownership-transfer strategies cross the engine boundary:
//!
//! * **Engine-allocated** regions, produced through the store's
//!   [`AllocHook`] and released exactly once when the caller finishes
//!   consuming them (or when the holding slot is dropped unconsumed).
//! * **Copy-on-demand** regions, requested by the engine mid-call and
//!   correlated with the transfer through an [`AllocToken`] index into a
//!   per-call [`AllocTable`]. The token is an index, never an address, so
//!   the correlation stays valid no matter where the backing buffer lives.

use std::cell::RefCell;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, StoreError};

/// Allocation hook shared between a store and its engine.
///
/// Stands in for the engine's malloc/realloc/free triple: every region the
/// engine hands across the boundary is granted here and must be released
/// here exactly once. The balance is observable, which is how the tests
/// prove nothing leaks.
#[derive(Debug, Default)]
pub struct AllocHook {
    granted: AtomicUsize,
    released: AtomicUsize,
}

impl AllocHook {
    /// Creates a fresh hook with a zero balance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a region holding a copy of `bytes`.
    pub fn grant(self: &Arc<Self>, bytes: &[u8]) -> EngineAlloc {
        self.granted.fetch_add(1, Ordering::Relaxed);
        EngineAlloc {
            data: Some(bytes.to_vec()),
            hook: Arc::clone(self),
        }
    }

    /// Number of granted regions not yet released.
    pub fn outstanding(&self) -> usize {
        self.granted.load(Ordering::Relaxed) - self.released.load(Ordering::Relaxed)
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A region allocated by the engine.
///
/// Released through the granting [`AllocHook`] exactly once: either when
/// ownership is taken with [`EngineAlloc::into_vec`], or on drop.
#[derive(Debug)]
pub struct EngineAlloc {
    data: Option<Vec<u8>>,
    hook: Arc<AllocHook>,
}

impl EngineAlloc {
    /// Borrows the region contents.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Takes ownership of the contents, releasing the engine region.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.hook.release();
        self.data.take().unwrap_or_default()
    }
}

impl Drop for EngineAlloc {
    fn drop(&mut self) {
        if self.data.take().is_some() {
            self.hook.release();
        }
    }
}

/// Correlation token for a copy-on-demand transfer.
///
/// An index into the call's [`AllocTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocToken(usize);

#[derive(Debug)]
enum AllocCell {
    Unallocated,
    Allocated(Vec<u8>),
    Redeemed,
}

/// Per-call table of copy-on-demand allocations.
///
/// State machine per cell: `Unallocated → Allocated → Redeemed`. The first
/// engine write allocates the full backing buffer; later writes copy into
/// an offset of the same buffer, which is what makes repeated partial
/// deliveries into one logical value safe. Redeeming twice fails with
/// [`StoreError::AlreadyMaterialized`].
#[derive(Debug, Default)]
pub struct AllocTable {
    cells: RefCell<Vec<AllocCell>>,
}

impl AllocTable {
    /// Creates an empty table for one operation call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new copy-on-demand transfer and returns its token.
    pub fn register(&self) -> AllocToken {
        let mut cells = self.cells.borrow_mut();
        cells.push(AllocCell::Unallocated);
        AllocToken(cells.len() - 1)
    }

    /// Copies `chunk` into the allocation at `offset`, allocating a
    /// zero-filled buffer of `total` bytes on the first call.
    pub fn copy_at(&self, token: AllocToken, total: usize, offset: usize, chunk: &[u8]) {
        let mut cells = self.cells.borrow_mut();
        let cell = &mut cells[token.0];
        if matches!(*cell, AllocCell::Unallocated) {
            *cell = AllocCell::Allocated(vec![0u8; total]);
        }
        if let AllocCell::Allocated(buf) = cell {
            let end = (offset + chunk.len()).min(buf.len());
            if offset < end {
                buf[offset..end].copy_from_slice(&chunk[..end - offset]);
            }
        }
    }

    /// Redeems the token, transferring the allocation to the caller.
    ///
    /// An unallocated cell redeems to an empty buffer (the engine never
    /// delivered anything, e.g. a zero-length value).
    pub fn redeem(&self, token: AllocToken) -> Result<Vec<u8>> {
        let mut cells = self.cells.borrow_mut();
        let cell = &mut cells[token.0];
        match std::mem::replace(cell, AllocCell::Redeemed) {
            AllocCell::Allocated(buf) => Ok(buf),
            AllocCell::Unallocated => Ok(Vec::new()),
            AllocCell::Redeemed => Err(StoreError::AlreadyMaterialized),
        }
    }
}

/// Streaming view over a transfer result.
///
/// For engine-allocated results the stream owns the engine region and
/// releases it when dropped; for copy-on-demand results it owns the
/// redeemed buffer.
#[derive(Debug)]
pub struct ValueStream {
    backing: Backing,
    pos: usize,
}

#[derive(Debug)]
enum Backing {
    Engine(EngineAlloc),
    Owned(Vec<u8>),
}

impl ValueStream {
    pub(crate) fn from_alloc(alloc: EngineAlloc) -> Self {
        Self {
            backing: Backing::Engine(alloc),
            pos: 0,
        }
    }

    /// Stream over an owned buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(data),
            pos: 0,
        }
    }

    /// Total length of the streamed value.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Engine(a) => a.as_slice().len(),
            Backing::Owned(v) => v.len(),
        }
    }

    /// Whether the streamed value is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for ValueStream {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let data = match &self.backing {
            Backing::Engine(a) => a.as_slice(),
            Backing::Owned(v) => v.as_slice(),
        };
        let remaining = &data[self.pos.min(data.len())..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_balance_tracks_grants_and_releases() {
        let hook = Arc::new(AllocHook::new());
        let a = hook.grant(b"abc");
        let b = hook.grant(b"def");
        assert_eq!(hook.outstanding(), 2);
        drop(a);
        assert_eq!(hook.outstanding(), 1);
        let v = b.into_vec();
        assert_eq!(v, b"def");
        assert_eq!(hook.outstanding(), 0);
    }

    #[test]
    fn into_vec_releases_once() {
        let hook = Arc::new(AllocHook::new());
        let v = hook.grant(b"xyz").into_vec();
        assert_eq!(v, b"xyz");
        assert_eq!(hook.outstanding(), 0);
    }

    #[test]
    fn chunked_copies_land_in_one_buffer() {
        let table = AllocTable::new();
        let token = table.register();
        table.copy_at(token, 6, 0, b"abc");
        table.copy_at(token, 6, 3, b"def");
        assert_eq!(table.redeem(token).unwrap(), b"abcdef");
    }

    #[test]
    fn double_redeem_fails() {
        let table = AllocTable::new();
        let token = table.register();
        table.copy_at(token, 2, 0, b"hi");
        table.redeem(token).unwrap();
        assert!(matches!(
            table.redeem(token),
            Err(StoreError::AlreadyMaterialized)
        ));
    }

    #[test]
    fn unallocated_redeems_empty() {
        let table = AllocTable::new();
        let token = table.register();
        assert!(table.redeem(token).unwrap().is_empty());
    }

    #[test]
    fn stream_reads_in_pieces() {
        let mut stream = ValueStream::from_vec(b"hello world".to_vec());
        assert_eq!(stream.len(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b" world");
    }
}
