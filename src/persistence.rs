//! Culture snapshot persistence.
//!
//! Snapshots are stored through the [`StoragePort`] as postcard bytes
//! under the "cultures" namespace, one key per vial (`vial3`).  A JSON
//! rendering is provided for the external persistence layer.
//!
//! Restoring checks the stored policy against the one the experiment
//! asks for; a mismatch is an error, never a silent conversion.

use core::fmt::Write as _;

use crate::app::ports::{StorageError, StoragePort};
use crate::culture::policy::PolicyKind;
use crate::culture::{Culture, CultureSnapshot};
use crate::error::SnapshotError;

const NAMESPACE: &str = "cultures";

fn key(vial: u8) -> heapless::String<8> {
    let mut s = heapless::String::new();
    let _ = write!(s, "vial{vial}");
    s
}

pub fn encode(snapshot: &CultureSnapshot) -> Result<Vec<u8>, SnapshotError> {
    postcard::to_allocvec(snapshot).map_err(|_| SnapshotError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<CultureSnapshot, SnapshotError> {
    postcard::from_bytes(bytes).map_err(|_| SnapshotError::Corrupted)
}

pub fn to_json(snapshot: &CultureSnapshot) -> Result<String, SnapshotError> {
    serde_json::to_string_pretty(snapshot).map_err(|_| SnapshotError::Encode)
}

pub fn from_json(json: &str) -> Result<CultureSnapshot, SnapshotError> {
    serde_json::from_str(json).map_err(|_| SnapshotError::Corrupted)
}

pub fn save(storage: &dyn StoragePort, snapshot: &CultureSnapshot) -> Result<(), SnapshotError> {
    let bytes = encode(snapshot)?;
    storage.write(NAMESPACE, &key(snapshot.vial), &bytes)?;
    log::debug!("Persistence: saved vial {} ({} bytes)", snapshot.vial, bytes.len());
    Ok(())
}

/// Load and restore the culture stored for `vial`.  `Ok(None)` when
/// nothing is stored.
pub fn load(
    storage: &dyn StoragePort,
    vial: u8,
    expected: PolicyKind,
) -> Result<Option<Culture>, SnapshotError> {
    let bytes = match storage.read(NAMESPACE, &key(vial)) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot = decode(&bytes)?;
    if snapshot.vial != vial {
        return Err(SnapshotError::Corrupted);
    }
    Culture::from_snapshot(expected, snapshot).map(Some)
}

/// Remove the stored snapshot of `vial`, if any.
pub fn delete(storage: &dyn StoragePort, vial: u8) -> Result<(), SnapshotError> {
    storage.delete(NAMESPACE, &key(vial))?;
    Ok(())
}

pub fn exists(storage: &dyn StoragePort, vial: u8) -> bool {
    storage.exists(NAMESPACE, &key(vial))
}
