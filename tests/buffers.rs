mod common;

use proptest::prelude::*;

use stratakv::buffer::DataBuffer;
use stratakv::codes::{GetOpFlags, PutOpFlags};

use common::open_store;

/// Window a stored value the way the signed partial convention promises:
/// a negative offset means the whole value, a negative length runs to the
/// end, and out-of-range windows clamp to the value.
fn expected_window(stored: &[u8], offset: i32, length: i32) -> Vec<u8> {
    if offset < 0 {
        return stored.to_vec();
    }
    let start = (offset as usize).min(stored.len());
    let end = if length < 0 {
        stored.len()
    } else {
        (start + length as usize).min(stored.len())
    };
    stored[start..end].to_vec()
}

proptest! {
    #[test]
    fn windowed_reads_match_the_signed_convention(
        value in proptest::collection::vec(any::<u8>(), 0..200),
        offset in -4i32..220,
        length in -4i32..220,
    ) {
        let store = open_store(3);
        let key = DataBuffer::bytes(b"k");
        let buffer = DataBuffer::bytes(&value);
        store.put(&key, -1, -1, &buffer, PutOpFlags::NONE).unwrap();

        let key = DataBuffer::bytes(b"k");
        let got = store
            .get_buffer(&key, offset, length, GetOpFlags::NONE)
            .unwrap()
            .unwrap();
        prop_assert_eq!(got, expected_window(&value, offset, length));
    }

    #[test]
    fn exact_size_buffers_round_trip(value in proptest::collection::vec(any::<u8>(), 0..200)) {
        let store = open_store(3);
        let key = DataBuffer::bytes(b"k");
        let buffer = DataBuffer::bytes(&value);
        store.put(&key, -1, -1, &buffer, PutOpFlags::NONE).unwrap();

        let key = DataBuffer::bytes(b"k");
        let mut out = vec![0u8; value.len()];
        let buffer = DataBuffer::bytes_mut(&mut out);
        let size = store.get(&key, -1, &buffer, GetOpFlags::NONE).unwrap();
        prop_assert_eq!(size as usize, value.len());
        prop_assert_eq!(out, value);
    }

    #[test]
    fn short_reads_report_the_true_size(
        value in proptest::collection::vec(any::<u8>(), 1..200),
        capacity in 0usize..64,
    ) {
        let store = open_store(3);
        let key = DataBuffer::bytes(b"k");
        let buffer = DataBuffer::bytes(&value);
        store.put(&key, -1, -1, &buffer, PutOpFlags::NONE).unwrap();

        let key = DataBuffer::bytes(b"k");
        let mut out = vec![0u8; capacity];
        let buffer = DataBuffer::bytes_mut(&mut out);
        let size = store.get(&key, -1, &buffer, GetOpFlags::NONE).unwrap();
        prop_assert_eq!(size as usize, value.len());
        let copied = capacity.min(value.len());
        prop_assert_eq!(&out[..copied], &value[..copied]);
    }

    #[test]
    fn windowed_writes_patch_in_place(
        base in proptest::collection::vec(any::<u8>(), 0..64),
        patch in proptest::collection::vec(any::<u8>(), 1..32),
        offset in 0i32..96,
    ) {
        let store = open_store(3);
        let key = DataBuffer::bytes(b"k");
        let buffer = DataBuffer::bytes(&base);
        store.put(&key, -1, -1, &buffer, PutOpFlags::NONE).unwrap();

        let key = DataBuffer::bytes(b"k");
        let buffer = DataBuffer::bytes(&patch);
        store.put(&key, offset, -1, &buffer, PutOpFlags::NONE).unwrap();

        let mut expected = base.clone();
        let end = offset as usize + patch.len();
        if expected.len() < end {
            expected.resize(end, 0);
        }
        expected[offset as usize..end].copy_from_slice(&patch);
        prop_assert_eq!(store.engine().committed_value(b"k").unwrap(), expected);
    }
}
