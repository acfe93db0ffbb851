//! Unified error types for the culture control engine.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! worker boundary's error handling uniform.  The taxonomy mirrors how
//! each failure is treated at runtime:
//!
//! | Variant              | Treatment                                        |
//! |----------------------|--------------------------------------------------|
//! | `DeviceIo`           | transient; logged, action abandoned, next cycle  |
//! | `PolicyViolation`    | fatal to starting that culture                   |
//! | `QueueSaturated`     | informational backpressure, not a fault          |
//! | `ResourceContention` | lock-ordering bug; logged loudly, never retried  |

use core::fmt;

use crate::app::ports::{PumpId, StorageError};

// ---------------------------------------------------------------------------
// Top-level engine error
// ---------------------------------------------------------------------------

/// Every fallible operation in the engine funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A hardware call failed.
    DeviceIo(DeviceError),
    /// A culture precondition check failed.
    PolicyViolation(PolicyViolation),
    /// The single operation slot was occupied; the action was dropped.
    QueueSaturated,
    /// A resource lock could not be acquired within the configured window.
    ResourceContention(Resource),
    /// Configuration is invalid or could not be parsed.
    Config(ConfigError),
    /// A persisted culture snapshot could not be restored.
    Snapshot(SnapshotError),
    /// No device is connected.
    NoDevice,
    /// The operation requires that no experiment is running.
    ExperimentRunning,
    /// The operation requires a running experiment.
    NoExperiment,
    /// A background thread could not be spawned.
    ThreadSpawn(&'static str),
    /// A scheduler or worker thread has terminated.
    EngineHalted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceIo(e) => write!(f, "device I/O: {e}"),
            Self::PolicyViolation(e) => write!(f, "policy violation: {e}"),
            Self::QueueSaturated => write!(f, "operation queue saturated"),
            Self::ResourceContention(r) => write!(f, "resource contention on {r}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Snapshot(e) => write!(f, "snapshot: {e}"),
            Self::NoDevice => write!(f, "no device connected"),
            Self::ExperimentRunning => write!(f, "an experiment is running"),
            Self::NoExperiment => write!(f, "no experiment is running"),
            Self::ThreadSpawn(name) => write!(f, "failed to spawn thread '{name}'"),
            Self::EngineHalted => write!(f, "an engine thread has terminated"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Device errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device is not connected.
    NotConnected,
    /// Connecting to the device failed.
    ConnectFailed(String),
    /// An optical density read failed for the given vial.
    OdReadFailed(u8),
    /// The temperature sensors could not be read.
    TemperatureReadFailed,
    /// A pump did not complete its dispense.
    DispenseFailed(PumpId),
    /// The stirrer controller rejected the command.
    StirrerFailed(u8),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "device not connected"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::OdReadFailed(vial) => write!(f, "OD read failed on vial {vial}"),
            Self::TemperatureReadFailed => write!(f, "temperature read failed"),
            Self::DispenseFailed(pump) => write!(f, "dispense failed on {pump}"),
            Self::StirrerFailed(vial) => write!(f, "stirrer command failed on vial {vial}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Self::DeviceIo(e)
    }
}

// ---------------------------------------------------------------------------
// Policy violations
// ---------------------------------------------------------------------------

/// Raised by `Culture::check()`.  Call sites treat these as fatal to
/// starting the culture, never as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    /// The device is not connected.
    DeviceDisconnected,
    /// Vial number outside `1..=VIAL_COUNT`.
    VialOutOfRange(u8),
    /// The vial's OD sensor or the pumps lack a calibration.
    MissingCalibration(u8),
    /// A policy parameter failed its sanity check.
    InvalidParameter(&'static str),
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceDisconnected => write!(f, "device disconnected"),
            Self::VialOutOfRange(v) => write!(f, "vial {v} out of range"),
            Self::MissingCalibration(v) => write!(f, "vial {v} is not calibrated"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}

impl std::error::Error for PolicyViolation {}

impl From<PolicyViolation> for Error {
    fn from(e: PolicyViolation) -> Self {
        Self::PolicyViolation(e)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// An exclusive hardware resource guarded by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Vial(u8),
    PumpManifold,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vial(v) => write!(f, "vial {v}"),
            Self::PumpManifold => write!(f, "pump manifold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The document could not be parsed (syntax, unknown field, wrong type).
    Parse(String),
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// The config file could not be read.
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Snapshot errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot belongs to a different policy than the one restoring it.
    PolicyMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Stored bytes failed to decode.
    Corrupted,
    /// Snapshot could not be encoded.
    Encode,
    /// The storage backend failed.
    Storage(StorageError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyMismatch { expected, found } => {
                write!(f, "policy mismatch: expected {expected}, found {found}")
            }
            Self::Corrupted => write!(f, "snapshot corrupted"),
            Self::Encode => write!(f, "snapshot encode failed"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<SnapshotError> for Error {
    fn from(e: SnapshotError) -> Self {
        Self::Snapshot(e)
    }
}

impl From<StorageError> for SnapshotError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
