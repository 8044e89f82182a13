#![allow(dead_code)]

use std::sync::Once;

use stratakv::config::StoreConfig;
use stratakv::engine::memory::MemoryEngine;
use stratakv::store::RecordStore;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn open_store(retries: u32) -> RecordStore<MemoryEngine> {
    init_tracing();
    RecordStore::open(
        MemoryEngine::new(),
        StoreConfig::new("test").max_deadlock_retries(retries),
    )
    .unwrap()
}

pub fn open_untransacted(retries: u32) -> RecordStore<MemoryEngine> {
    init_tracing();
    RecordStore::open(
        MemoryEngine::new(),
        StoreConfig::new("test")
            .transactional(false)
            .max_deadlock_retries(retries),
    )
    .unwrap()
}
