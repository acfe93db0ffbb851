//! Fuzz target: `FailureLog` ring buffer
//!
//! Drives arbitrary `record` / `persist` / `clear` sequences and verifies:
//! - No panics under arbitrary byte inputs
//! - The ring never holds more than `FAILURE_RING_SLOTS` entries
//! - A persisted ring loads back identical
//!
//! cargo fuzz run fuzz_failure_log

#![no_main]

use libfuzzer_sys::fuzz_target;
use replifactory::adapters::memory_store::MemoryStore;
use replifactory::diagnostics::{FAILURE_RING_SLOTS, FailureEntry, FailureLog};

fuzz_target!(|data: &[u8]| {
    let log = FailureLog::new();
    let store = MemoryStore::new();

    for chunk in data.chunks(8) {
        let op = chunk[0] % 3;
        let text = String::from_utf8_lossy(&chunk[1..]);
        match op {
            0 => log.record(FailureEntry::new(f64::from(chunk[0]), &text, &text)),
            1 => {
                if log.persist(&store).is_ok() {
                    assert_eq!(FailureLog::load_persisted(&store), log.entries());
                }
            }
            _ => log.clear(),
        }
        assert!(log.entries().len() <= FAILURE_RING_SLOTS);
    }
});
