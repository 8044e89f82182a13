//! Buffer descriptors and transfer slots.
//!
//! A [`DataBuffer`] describes caller memory for exactly one engine call.
//! The store resolves it into a [`TransferSlot`](slot::TransferSlot), which
//! owns the negotiation with the engine: direction, partial windows, and
//! which side allocates.

pub mod alloc;
pub mod slot;

use std::cell::{Cell, RefCell};

use crate::error::{Result, StoreError};

pub use alloc::{AllocHook, AllocTable, AllocToken, EngineAlloc, ValueStream};
pub use slot::TransferSlot;

#[derive(Debug)]
enum BufferKind<'a> {
    /// No caller memory. Readable as zero bytes, writable as a pure size
    /// probe (zero capacity).
    Empty,
    Int32(i32),
    Int64(i64),
    Region(&'a [u8]),
    /// Interior mutability lets a shared `&DataBuffer` yield the region
    /// once without the descriptor itself being `&mut`.
    RegionMut(RefCell<Option<&'a mut [u8]>>),
}

/// Single-use descriptor of caller memory for one engine call.
///
/// A descriptor resolves into a transfer slot at most once; a second
/// resolution fails with [`StoreError::BufferReused`]. This is what keeps a
/// buffer from being aliased across two concurrent engine calls.
#[derive(Debug)]
pub struct DataBuffer<'a> {
    kind: BufferKind<'a>,
    resolved: Cell<bool>,
}

impl<'a> DataBuffer<'a> {
    fn with_kind(kind: BufferKind<'a>) -> Self {
        Self {
            kind,
            resolved: Cell::new(false),
        }
    }

    /// Descriptor with no memory attached.
    ///
    /// As an output it acts as a size probe: the call reports the stored
    /// size without copying anything.
    pub fn empty() -> Self {
        Self::with_kind(BufferKind::Empty)
    }

    /// Descriptor over a 32-bit integer key or value.
    pub fn from_i32(v: i32) -> Self {
        Self::with_kind(BufferKind::Int32(v))
    }

    /// Descriptor over a 64-bit integer key or value.
    pub fn from_i64(v: i64) -> Self {
        Self::with_kind(BufferKind::Int64(v))
    }

    /// Read-only descriptor over a byte region.
    pub fn bytes(region: &'a [u8]) -> Self {
        Self::with_kind(BufferKind::Region(region))
    }

    /// Writable descriptor over a byte region.
    pub fn bytes_mut(region: &'a mut [u8]) -> Self {
        Self::with_kind(BufferKind::RegionMut(RefCell::new(Some(region))))
    }

    /// Read-only descriptor over a text key.
    pub fn text(s: &'a str) -> Self {
        Self::bytes(s.as_bytes())
    }

    /// Read-only descriptor over a storage entry's live window.
    pub fn entry(entry: &'a StorageEntry) -> Self {
        Self::bytes(entry.window())
    }

    /// Writable descriptor over a storage entry's live window.
    pub fn entry_mut(entry: &'a mut StorageEntry) -> Self {
        Self::bytes_mut(entry.window_mut())
    }

    /// Number of bytes the descriptor spans.
    pub fn byte_length(&self) -> usize {
        match &self.kind {
            BufferKind::Empty => 0,
            BufferKind::Int32(_) => 4,
            BufferKind::Int64(_) => 8,
            BufferKind::Region(r) => r.len(),
            BufferKind::RegionMut(r) => r.borrow().as_ref().map_or(0, |s| s.len()),
        }
    }

    /// Whether the descriptor spans zero bytes.
    pub fn is_empty(&self) -> bool {
        self.byte_length() == 0
    }

    fn mark_resolved(&self) -> Result<()> {
        if self.resolved.replace(true) {
            return Err(StoreError::BufferReused);
        }
        Ok(())
    }

    pub(crate) fn resolve_read(&self) -> Result<slot::Payload<'_>> {
        self.mark_resolved()?;
        Ok(match &self.kind {
            BufferKind::Empty => slot::Payload::Slice(&[]),
            BufferKind::Int32(v) => slot::Payload::scalar(&v.to_le_bytes()),
            BufferKind::Int64(v) => slot::Payload::scalar(&v.to_le_bytes()),
            BufferKind::Region(r) => slot::Payload::Slice(r),
            BufferKind::RegionMut(r) => {
                // A writable region is still a valid input; take it so the
                // single-use guarantee holds either way.
                match r.borrow_mut().take() {
                    Some(region) => slot::Payload::Slice(region),
                    None => return Err(StoreError::BufferReused),
                }
            }
        })
    }

    pub(crate) fn resolve_write(&self) -> Result<Option<&mut [u8]>> {
        self.mark_resolved()?;
        match &self.kind {
            BufferKind::Empty => Ok(None),
            BufferKind::RegionMut(r) => match r.borrow_mut().take() {
                Some(region) => Ok(Some(region)),
                None => Err(StoreError::BufferReused),
            },
            _ => Err(StoreError::NotWritable),
        }
    }
}

/// Owned record image used by read-modify-write operations.
///
/// `start` and `length` select the live window inside `buffer`; the
/// transform callback may rewrite any of the three fields before the
/// updated window is written back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageEntry {
    /// Backing bytes.
    pub buffer: Vec<u8>,
    /// Offset of the live window within `buffer`.
    pub start: usize,
    /// Length of the live window.
    pub length: usize,
}

impl StorageEntry {
    /// Entry whose live window covers the whole buffer.
    pub fn new(buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self {
            buffer,
            start: 0,
            length,
        }
    }

    /// Entry with `capacity` zeroed bytes and an empty live window.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            start: 0,
            length: 0,
        }
    }

    /// The live window, clamped to the backing buffer.
    pub fn window(&self) -> &[u8] {
        let start = self.start.min(self.buffer.len());
        let end = (start + self.length).min(self.buffer.len());
        &self.buffer[start..end]
    }

    /// Mutable view of the live window, clamped to the backing buffer.
    pub fn window_mut(&mut self) -> &mut [u8] {
        let start = self.start.min(self.buffer.len());
        let end = (start + self.length).min(self.buffer.len());
        &mut self.buffer[start..end]
    }
}
