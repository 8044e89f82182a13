//! Transfer slots: the negotiated view of one buffer for one engine call.

use std::sync::Arc;

use crate::buffer::alloc::{AllocHook, AllocTable, AllocToken, EngineAlloc, ValueStream};
use crate::buffer::DataBuffer;
use crate::codes::ReturnCode;
use crate::error::Result;

/// Input bytes carried by a read-direction slot.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Borrowed caller region.
    Slice(&'a [u8]),
    /// Little-endian image of an integer descriptor, held inline.
    Scalar {
        /// Encoded bytes.
        bytes: [u8; 8],
        /// Number of significant bytes.
        len: u8,
    },
}

impl Payload<'_> {
    pub(crate) fn scalar(encoded: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..encoded.len()].copy_from_slice(encoded);
        Payload::Scalar {
            bytes,
            len: encoded.len() as u8,
        }
    }

    /// The carried bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Slice(s) => s,
            Payload::Scalar { bytes, len } => &bytes[..*len as usize],
        }
    }
}

/// Byte window applied to the stored value before transfer.
#[derive(Debug, Clone, Copy)]
struct PartialWindow {
    offset: usize,
    /// `None` reads from `offset` to the end of the stored value.
    len: Option<usize>,
}

#[derive(Debug)]
enum SlotMode<'a> {
    /// Caller supplies the bytes; the engine only reads them.
    ReadOnly { payload: Payload<'a> },
    /// Caller supplies the capacity; the engine copies into it. A
    /// zero-capacity region acts as a size probe.
    UserMemory { buf: &'a mut [u8] },
    /// The engine allocates through the store's hook and the caller takes
    /// ownership afterwards.
    EngineAllocated {
        hook: Arc<AllocHook>,
        alloc: Option<EngineAlloc>,
    },
    /// The engine requests space mid-call, correlated by token.
    CopyOnDemand {
        table: &'a AllocTable,
        token: AllocToken,
    },
}

/// One buffer's negotiated role in one engine call.
///
/// Built by the store from a [`DataBuffer`] (or from an allocation source
/// for the allocating read surfaces), consumed by the engine through
/// [`TransferSlot::payload`] and [`TransferSlot::deliver`], then drained by
/// the store through the `found_size`/materialize accessors.
#[derive(Debug)]
pub struct TransferSlot<'a> {
    mode: SlotMode<'a>,
    partial: Option<PartialWindow>,
    take: Option<usize>,
    found_size: Option<usize>,
}

impl<'a> TransferSlot<'a> {
    fn with_mode(mode: SlotMode<'a>) -> Self {
        Self {
            mode,
            partial: None,
            take: None,
            found_size: None,
        }
    }

    /// Slot carrying caller bytes into the engine.
    pub fn for_read(buffer: &'a DataBuffer<'_>) -> Result<Self> {
        Ok(Self::with_mode(SlotMode::ReadOnly {
            payload: buffer.resolve_read()?,
        }))
    }

    /// Slot receiving engine bytes into caller memory.
    ///
    /// An empty descriptor yields a zero-capacity slot, which reports the
    /// stored size without copying.
    pub fn for_write(buffer: &'a DataBuffer<'_>) -> Result<Self> {
        let buf = buffer.resolve_write()?.unwrap_or(&mut []);
        Ok(Self::with_mode(SlotMode::UserMemory { buf }))
    }

    /// Slot whose backing memory the engine allocates through `hook`.
    pub fn engine_allocated(hook: &Arc<AllocHook>) -> Self {
        Self::with_mode(SlotMode::EngineAllocated {
            hook: Arc::clone(hook),
            alloc: None,
        })
    }

    /// Slot whose backing memory the engine requests on demand.
    pub fn copy_on_demand(table: &'a AllocTable) -> Self {
        Self::with_mode(SlotMode::CopyOnDemand {
            table,
            token: table.register(),
        })
    }

    /// Applies a partial window in the signed convention of the record
    /// surface: a negative offset disables windowing entirely, a negative
    /// length reads from the offset to the end of the stored value.
    pub fn set_partial(&mut self, offset: i32, length: i32) {
        self.partial = if offset < 0 {
            None
        } else {
            Some(PartialWindow {
                offset: offset as usize,
                len: if length < 0 {
                    None
                } else {
                    Some(length as usize)
                },
            })
        };
    }

    /// The partial window in effect, as `(offset, length)` where a `None`
    /// length runs to the end of the stored value.
    pub fn window_spec(&self) -> Option<(usize, Option<usize>)> {
        self.partial.map(|w| (w.offset, w.len))
    }

    /// Whether this slot's memory is engine-requested on demand.
    pub fn is_copy_on_demand(&self) -> bool {
        matches!(self.mode, SlotMode::CopyOnDemand { .. })
    }

    /// Caps how many input bytes the slot carries, for writes that send
    /// only a prefix of the caller's buffer.
    pub fn limit_payload(&mut self, count: usize) {
        self.take = Some(count);
    }

    /// Input bytes, for slots the engine reads from.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.mode {
            SlotMode::ReadOnly { payload } => {
                let bytes = payload.as_bytes();
                Some(match self.take {
                    Some(n) => &bytes[..n.min(bytes.len())],
                    None => bytes,
                })
            }
            _ => None,
        }
    }

    /// Bytes a key-seeking position reads. Unlike [`TransferSlot::payload`]
    /// this also covers user-memory slots, whose contents seed a seek and
    /// are then overwritten with the matched key.
    pub fn seek_bytes(&self) -> Option<&[u8]> {
        match &self.mode {
            SlotMode::ReadOnly { payload } => Some(payload.as_bytes()),
            SlotMode::UserMemory { buf } => Some(&buf[..]),
            _ => None,
        }
    }

    /// Size of the stored (windowed) value, set once the engine delivers.
    pub fn found_size(&self) -> Option<usize> {
        self.found_size
    }

    fn windowed<'v>(&self, stored: &'v [u8]) -> &'v [u8] {
        match self.partial {
            None => stored,
            Some(PartialWindow { offset, len }) => {
                let start = offset.min(stored.len());
                let end = match len {
                    Some(n) => (start + n).min(stored.len()),
                    None => stored.len(),
                };
                &stored[start..end]
            }
        }
    }

    /// Delivers a stored value into the slot, applying any partial window.
    ///
    /// Returns [`ReturnCode::BufferSmall`] when caller memory cannot hold
    /// the windowed value; the prefix that fits is still copied and the
    /// true size is recorded.
    pub fn deliver(&mut self, stored: &[u8]) -> ReturnCode {
        let window = self.windowed(stored);
        self.found_size = Some(window.len());
        match &mut self.mode {
            SlotMode::ReadOnly { .. } => ReturnCode::BufferSmall,
            SlotMode::UserMemory { buf } => {
                let n = window.len().min(buf.len());
                buf[..n].copy_from_slice(&window[..n]);
                if window.len() > buf.len() {
                    ReturnCode::BufferSmall
                } else {
                    ReturnCode::Success
                }
            }
            SlotMode::EngineAllocated { hook, alloc } => {
                *alloc = Some(hook.grant(window));
                ReturnCode::Success
            }
            SlotMode::CopyOnDemand { table, token } => {
                table.copy_at(*token, window.len(), 0, window);
                ReturnCode::Success
            }
        }
    }

    /// Takes the delivered value as a stream (engine-allocated slots).
    ///
    /// `None` when the engine never delivered anything.
    pub fn materialize_stream(&mut self) -> Option<ValueStream> {
        match &mut self.mode {
            SlotMode::EngineAllocated { alloc, .. } => alloc.take().map(ValueStream::from_alloc),
            _ => None,
        }
    }

    /// Takes the delivered value as an owned buffer (copy-on-demand slots).
    pub fn materialize_buffer(&mut self) -> Result<Vec<u8>> {
        match &self.mode {
            SlotMode::CopyOnDemand { table, token } => table.redeem(*token),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_memory_full_copy() {
        let mut region = [0u8; 8];
        let buf = DataBuffer::bytes_mut(&mut region);
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        assert_eq!(slot.deliver(b"hello"), ReturnCode::Success);
        assert_eq!(slot.found_size(), Some(5));
        drop(slot);
        assert_eq!(&region[..5], b"hello");
    }

    #[test]
    fn undersized_memory_gets_prefix_and_small_code() {
        let mut region = [0u8; 3];
        let buf = DataBuffer::bytes_mut(&mut region);
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        assert_eq!(slot.deliver(b"hello"), ReturnCode::BufferSmall);
        assert_eq!(slot.found_size(), Some(5));
        drop(slot);
        assert_eq!(&region, b"hel");
    }

    #[test]
    fn zero_capacity_probe_reports_size() {
        let buf = DataBuffer::empty();
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        assert_eq!(slot.deliver(b"hello"), ReturnCode::BufferSmall);
        assert_eq!(slot.found_size(), Some(5));
    }

    #[test]
    fn negative_offset_disables_window() {
        let mut region = [0u8; 8];
        let buf = DataBuffer::bytes_mut(&mut region);
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        slot.set_partial(-1, 2);
        slot.deliver(b"abcdef");
        assert_eq!(slot.found_size(), Some(6));
    }

    #[test]
    fn negative_length_reads_to_end() {
        let mut region = [0u8; 8];
        let buf = DataBuffer::bytes_mut(&mut region);
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        slot.set_partial(2, -1);
        slot.deliver(b"abcdef");
        assert_eq!(slot.found_size(), Some(4));
        drop(slot);
        assert_eq!(&region[..4], b"cdef");
    }

    #[test]
    fn window_past_end_is_empty() {
        let mut region = [0u8; 8];
        let buf = DataBuffer::bytes_mut(&mut region);
        let mut slot = TransferSlot::for_write(&buf).unwrap();
        slot.set_partial(10, 4);
        slot.deliver(b"abc");
        assert_eq!(slot.found_size(), Some(0));
    }

    #[test]
    fn engine_allocated_value_streams_out() {
        let hook = Arc::new(AllocHook::new());
        let mut slot = TransferSlot::engine_allocated(&hook);
        slot.deliver(b"payload");
        assert_eq!(hook.outstanding(), 1);
        let stream = slot.materialize_stream().unwrap();
        assert_eq!(stream.len(), 7);
        drop(stream);
        assert_eq!(hook.outstanding(), 0);
    }

    #[test]
    fn copy_on_demand_value_redeems() {
        let table = AllocTable::new();
        let mut slot = TransferSlot::copy_on_demand(&table);
        slot.set_partial(1, 3);
        slot.deliver(b"abcdef");
        assert_eq!(slot.materialize_buffer().unwrap(), b"bcd");
    }

    #[test]
    fn slots_build_from_short_lived_descriptor_borrows() {
        // The descriptor's region lifetime and the borrow handed to the
        // slot are independent, as they are on every store surface.
        fn fill(buf: &DataBuffer<'_>) -> usize {
            let mut slot = TransferSlot::for_write(buf).unwrap();
            slot.deliver(b"abc");
            slot.found_size().unwrap()
        }
        fn read_len(buf: &DataBuffer<'_>) -> usize {
            let slot = TransferSlot::for_read(buf).unwrap();
            slot.payload().map_or(0, <[u8]>::len)
        }
        let mut region = [0u8; 4];
        let buf = DataBuffer::bytes_mut(&mut region);
        assert_eq!(fill(&buf), 3);
        assert_eq!(&region[..3], b"abc");

        let buf = DataBuffer::bytes(b"hello");
        assert_eq!(read_len(&buf), 5);
    }

    #[test]
    fn scalar_payload_round_trips() {
        let buf = DataBuffer::from_i32(0x0a0b0c0d);
        let slot = TransferSlot::for_read(&buf).unwrap();
        assert_eq!(slot.payload().unwrap(), &0x0a0b0c0d_i32.to_le_bytes());
    }
}
