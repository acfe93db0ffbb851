//! Fuzz target: culture snapshot decoding
//!
//! Decodes arbitrary bytes as a postcard culture snapshot and, when that
//! succeeds, restores a culture from it:
//! - No panics under arbitrary input
//! - A restored culture keeps the snapshot's vial and policy, and starts
//!   with an empty OD history
//!
//! cargo fuzz run fuzz_snapshot_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use replifactory::culture::Culture;
use replifactory::persistence;

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = persistence::decode(data) else {
        return;
    };
    let vial = snapshot.vial;
    let kind = snapshot.policy.kind();
    let culture = Culture::from_snapshot(kind, snapshot).expect("matching policy restores");
    assert_eq!(culture.vial(), vial);
    assert_eq!(culture.kind(), kind);
    assert!(culture.od_history().is_empty());
    let _ = culture.status();
});
