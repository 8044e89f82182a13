mod common;

use stratakv::buffer::{DataBuffer, StorageEntry};
use stratakv::codes::{PutOpFlags, ReturnCode};
use stratakv::engine::memory::Fault;
use stratakv::store::Lengths;

use common::{open_store, open_untransacted};

#[test]
fn update_rewrites_an_existing_record() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"counter");
    let value = DataBuffer::bytes(b"41");
    store.put(&key, -1, -1, &value, PutOpFlags::NONE).unwrap();

    let key = DataBuffer::bytes(b"counter");
    let mut entry = StorageEntry::default();
    let written = store
        .update(&key, &mut entry, |e| {
            assert_eq!(e.window(), b"41");
            e.buffer = b"42".to_vec();
            e.start = 0;
            e.length = 2;
        })
        .unwrap();
    assert_eq!(written, 2);
    assert_eq!(store.engine().committed_value(b"counter").unwrap(), b"42");
}

#[test]
fn update_inserts_when_the_record_is_missing() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"fresh");
    let mut entry = StorageEntry::default();
    let written = store
        .update(&key, &mut entry, |e| {
            assert_eq!(e.length, 0);
            e.buffer = b"created".to_vec();
            e.start = 0;
            e.length = 7;
        })
        .unwrap();
    assert_eq!(written, 7);
    assert_eq!(store.engine().committed_value(b"fresh").unwrap(), b"created");
}

#[test]
fn update_deletes_when_the_window_is_zeroed() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"doomed");
    let value = DataBuffer::bytes(b"v");
    store.put(&key, -1, -1, &value, PutOpFlags::NONE).unwrap();

    let key = DataBuffer::bytes(b"doomed");
    let mut entry = StorageEntry::default();
    let written = store.update(&key, &mut entry, |e| e.length = 0).unwrap();
    assert_eq!(written, Lengths::DELETED);
    assert!(store.engine().committed_value(b"doomed").is_none());
}

#[test]
fn update_on_a_missing_record_can_be_a_no_op() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"ghost");
    let mut entry = StorageEntry::default();
    let written = store.update(&key, &mut entry, |_| {}).unwrap();
    assert_eq!(written, Lengths::NOT_FOUND);
    assert!(store.engine().committed_value(b"ghost").is_none());
}

#[test]
fn update_writes_only_the_live_window() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"windowed");
    let mut entry = StorageEntry::default();
    store
        .update(&key, &mut entry, |e| {
            e.buffer = b"xxPAYLOADxx".to_vec();
            e.start = 2;
            e.length = 7;
        })
        .unwrap();
    assert_eq!(store.engine().committed_value(b"windowed").unwrap(), b"PAYLOAD");
}

#[test]
fn deadlocked_update_replays_on_a_fresh_transaction() {
    let store = open_store(3);
    let key = DataBuffer::bytes(b"k");
    let value = DataBuffer::bytes(b"1");
    store.put(&key, -1, -1, &value, PutOpFlags::NONE).unwrap();

    store.engine().inject_deadlocks(1);
    let key = DataBuffer::bytes(b"k");
    let mut entry = StorageEntry::default();
    let written = store
        .update(&key, &mut entry, |e| {
            e.buffer = b"2".to_vec();
            e.start = 0;
            e.length = 1;
        })
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(store.engine().committed_value(b"k").unwrap(), b"2");
    assert_eq!(store.engine().txn_stats().aborted, 1);
}

#[test]
fn losing_an_insert_race_replays_without_spending_budget() {
    // Budget is forced to 1 here, so the replay only succeeds because a
    // refused exclusive insert is not charged as a retry.
    let store = open_untransacted(1);
    store.engine().inject(Fault::Pass);
    store.engine().inject(Fault::Code(ReturnCode::KeyExist));

    let key = DataBuffer::bytes(b"contended");
    let mut entry = StorageEntry::default();
    let mut transforms = 0;
    let written = store
        .update(&key, &mut entry, |e| {
            transforms += 1;
            e.buffer = b"mine".to_vec();
            e.start = 0;
            e.length = 4;
        })
        .unwrap();
    assert_eq!(written, 4);
    // fetch + refused insert, then fetch + insert.
    assert_eq!(transforms, 2);
    assert_eq!(store.engine().op_count(), 4);
    assert_eq!(store.engine().committed_value(b"contended").unwrap(), b"mine");
}

#[test]
fn concurrent_updates_converge_on_one_record() {
    let store = open_untransacted(3);

    std::thread::scope(|s| {
        for id in [b'a', b'b', b'c', b'd'] {
            let store = &store;
            s.spawn(move || {
                let key = DataBuffer::bytes(b"shared");
                let mut entry = StorageEntry::default();
                store
                    .update(&key, &mut entry, |e| {
                        let mut next = e.window().to_vec();
                        next.push(id);
                        e.length = next.len();
                        e.start = 0;
                        e.buffer = next;
                    })
                    .unwrap();
            });
        }
    });

    let value = store.engine().committed_value(b"shared").unwrap();
    assert!(!value.is_empty());
    assert!(value.iter().all(|b| (b'a'..=b'd').contains(b)));
}
