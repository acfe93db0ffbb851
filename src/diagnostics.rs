//! Failure logging and runtime diagnostics.
//!
//! Keeps the last [`FAILURE_RING_SLOTS`] job failures in a bounded ring
//! (oldest overwritten first).  Each entry captures the wall-clock time,
//! the job label and a truncated reason.  The ring can be persisted
//! through the storage port under the "diag" namespace so a post-mortem
//! survives a restart.
//!
//! Worker counters and thread liveness are collected on demand into
//! [`RuntimeMetrics`] and [`EngineHealth`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};

use crate::app::ports::{StorageError, StoragePort};

pub const FAILURE_RING_SLOTS: usize = 16;
const DIAG_NAMESPACE: &str = "diag";
const FAILURE_KEY: &str = "failures";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Unix seconds.
    pub timestamp: f64,
    pub job: heapless::String<24>,
    pub reason: heapless::String<64>,
}

impl FailureEntry {
    pub fn new(timestamp: f64, job: &str, reason: &str) -> Self {
        Self {
            timestamp,
            job: truncated(job),
            reason: truncated(reason),
        }
    }
}

fn truncated<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// In-memory ring of recent failures.
pub struct FailureLog {
    ring: Mutex<HistoryBuffer<FailureEntry, FAILURE_RING_SLOTS>>,
    total: AtomicU64,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureLog {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(HistoryBuffer::new()),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, entry: FailureEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.write(entry);
    }

    /// Seed the ring with entries from an earlier run.  The running total
    /// counts only failures of this run.
    pub fn preload(&self, entries: impl IntoIterator<Item = FailureEntry>) {
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        for entry in entries {
            ring.write(entry);
        }
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<FailureEntry> {
        let ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.oldest_ordered().cloned().collect()
    }

    /// Failures recorded since start, including those already overwritten.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.clear();
    }

    /// Write the retained entries to storage.
    pub fn persist(&self, storage: &dyn StoragePort) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(&self.entries()).map_err(|_| StorageError::IoError)?;
        storage.write(DIAG_NAMESPACE, FAILURE_KEY, &bytes)
    }

    /// Read entries persisted by an earlier run.  Missing or undecodable
    /// data yields an empty list.
    pub fn load_persisted(storage: &dyn StoragePort) -> Vec<FailureEntry> {
        storage
            .read(DIAG_NAMESPACE, FAILURE_KEY)
            .ok()
            .and_then(|bytes| postcard::from_bytes(&bytes).ok())
            .unwrap_or_default()
    }
}

/// Counters of one operation queue worker.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl WorkerCounters {
    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Runtime diagnostics snapshot collected on demand.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub uptime_secs: f64,
    pub scheduler_ticks: u64,
    pub measurement: WorkerStats,
    pub dilution: WorkerStats,
    pub failures_total: u64,
    pub recent_failures: Vec<FailureEntry>,
}

/// Liveness of the three engine threads.
///
/// A dead thread is never restarted; it is reported upward and needs an
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub scheduler_alive: bool,
    pub measurement_worker_alive: bool,
    pub dilution_worker_alive: bool,
}

impl EngineHealth {
    pub fn is_healthy(&self) -> bool {
        self.scheduler_alive && self.measurement_worker_alive && self.dilution_worker_alive
    }
}

/// Install a panic hook that routes panic messages through the logger.
///
/// Job panics are caught at the worker boundary; the hook only makes sure
/// the message lands in the same log stream as everything else.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };
        let thread = std::thread::current();
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        log::error!(
            "PANIC in '{}': {} ({})",
            thread.name().unwrap_or("?"),
            reason,
            location
        );
    }));
}

/// Best-effort text of a caught panic payload.
pub fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
