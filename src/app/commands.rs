//! Inbound commands to the experiment manager.
//!
//! These represent operator actions (dashboard, CLI, tests) that the
//! [`ExperimentManager`](super::service::ExperimentManager) interprets
//! while an experiment runs.

/// Commands that external adapters can send into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    /// Skip culture updates; measurements continue.
    Pause,

    /// Resume culture updates from the next update slot.
    Resume,

    /// Dilute one vial now, keeping its policy's drug target.
    ForceDilution(u8),

    /// Take one culture out of the control loop.
    Deactivate(u8),

    /// Persist every culture snapshot through the storage port.
    SaveSnapshots,
}
