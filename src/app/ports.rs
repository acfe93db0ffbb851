//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Device / ExperimentManager (domain)
//! ```
//!
//! Driven adapters (bioreactor driver, clock, event sinks, storage) implement
//! these traits.  The engine holds them as trait objects shared across the
//! scheduler and worker threads, so every port is `Send + Sync` and takes
//! `&self`; implementations synchronise internally.
//!
//! ## Contract notes
//!
//! - **DevicePort** calls block (tens of ms to seconds) and may fail.  The
//!   engine only ever calls them from a worker thread while holding the
//!   owning resource lock.
//! - Readings and volumes are already calibrated physical units.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Number of culture vials on one machine.  Vials are numbered `1..=VIAL_COUNT`.
pub const VIAL_COUNT: u8 = 7;

// ───────────────────────────────────────────────────────────────
// Device port (driven adapter: domain ↔ bioreactor hardware)
// ───────────────────────────────────────────────────────────────

/// Pumps on the shared manifold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PumpId {
    /// Fresh medium without drug.
    Medium1,
    /// Medium carrying the drug / stressor at stock concentration.
    Medium2,
    /// Vacuum pump that removes liquid above the dead-volume level.
    Waste,
}

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Medium1 => write!(f, "pump 1 (medium 1)"),
            Self::Medium2 => write!(f, "pump 2 (medium 2)"),
            Self::Waste => write!(f, "pump 4 (waste)"),
        }
    }
}

/// Stirrer speed presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StirrerSpeed {
    Stopped,
    Low,
    High,
}

/// Blocking access to the physical machine.
pub trait DevicePort: Send + Sync {
    /// Open the connection.  A single blocking attempt; never retries.
    fn connect(&self) -> Result<(), DeviceError>;

    /// Close the connection.  Idempotent.
    fn disconnect(&self);

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Whether the vial's OD sensor and the pumps carry a calibration.
    fn is_calibrated(&self, vial: u8) -> bool;

    /// Read the optical density of one vial.
    fn read_od(&self, vial: u8) -> Result<f64, DeviceError>;

    /// Read the two temperature probes (vial block, board) in °C.
    fn read_temperature(&self) -> Result<(f64, f64), DeviceError>;

    /// Dispense `volume_ml` through `pump`, routed to `vial`.
    fn dispense(&self, vial: u8, pump: PumpId, volume_ml: f64) -> Result<(), DeviceError>;

    /// Set a vial's stirrer speed.
    fn set_stirrer_speed(&self, vial: u8, speed: StirrerSpeed) -> Result<(), DeviceError>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Wall-clock source.  Injected so schedules and policies can be driven
/// by a synthetic clock in tests.
pub trait ClockPort: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go (log, dashboard
/// websocket, database).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &super::events::AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ persistence layer)
// ───────────────────────────────────────────────────────────────

/// Key-value storage for culture snapshots.
///
/// - Keys are namespaced to prevent collisions between subsystems.
/// - Write operations MUST be atomic: no partial snapshots on crash.
pub trait StoragePort: Send + Sync {
    /// Read a value.
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a value atomically.
    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Scheduler delegate (decouples scheduler from the worker queues)
// ───────────────────────────────────────────────────────────────

/// Callback trait that the scheduler invokes when a job falls due.
///
/// The [`Scheduler`](crate::scheduler::Scheduler) knows nothing about
/// queues, devices or cultures; the engine implements this by enqueueing
/// the job onto the matching operation queue.
pub trait SchedulerDelegate {
    /// Called when a job falls due.
    ///
    /// * `label`: the human-readable label of the job.
    /// * `job`: which job fired.
    fn on_job_due(&mut self, label: &'static str, job: JobKind);
}

/// The periodic jobs the engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Read the temperature probes.
    Temperature,
    /// Read OD of every active vial.
    OdMeasurement,
    /// Run `update()` on every active culture and perform any dilutions.
    CultureUpdate,
    /// Run the waste pump after dilutions.
    TubingFlush,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::OdMeasurement => write!(f, "od-measurement"),
            Self::CultureUpdate => write!(f, "culture-update"),
            Self::TubingFlush => write!(f, "tubing-flush"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage is full.
    Full,
    /// Generic I/O error.
    IoError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for StorageError {}
