//! Directory-backed key-value store.
//!
//! Implements [`StoragePort`] on the local filesystem so culture snapshots
//! and the failure ring survive a restart of the binary.  Each value lives
//! in `<root>/<namespace>/<key>.bin`; writes go to a temporary file that
//! is renamed over the target, so a crash leaves the old value intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::app::ports::{StorageError, StoragePort};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            warn!("FileStore: cannot create {}: {e}", root.display());
            StorageError::IoError
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(namespace) || !valid(key) {
            return Err(StorageError::IoError);
        }
        Ok(self.root.join(namespace).join(format!("{key}.bin")))
    }
}

fn io_error(e: &std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound,
        ErrorKind::StorageFull => StorageError::Full,
        _ => StorageError::IoError,
    }
}

impl StoragePort for FileStore {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(namespace, key)?;
        fs::read(&path).map_err(|e| io_error(&e))
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;
        let Some(dir) = path.parent() else {
            return Err(StorageError::IoError);
        };
        fs::create_dir_all(dir).map_err(|e| io_error(&e))?;
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, data).map_err(|e| io_error(&e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&e))?;
        debug!("FileStore: wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&e)),
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.path(namespace, key).is_ok_and(|p| p.is_file())
    }
}
