//! Outbound application events.
//!
//! The [`ExperimentManager`](super::service::ExperimentManager) and the
//! worker jobs emit these through the [`EventSink`](super::ports::EventSink)
//! port.  Adapters on the other side decide what to do with them: log
//! them, push them to a dashboard, append them to a database.

use serde::{Deserialize, Serialize};

use super::ports::JobKind;
use crate::culture::policy::PolicyKind;
use crate::error::PolicyViolation;

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Per-culture status after every culture-update job.
    Telemetry(CultureStatus),

    /// Temperature probes were read.
    Temperature { vial_block_c: f64, board_c: f64 },

    /// A dilution completed on the pumps and was committed.
    DilutionPerformed {
        vial: u8,
        medium1_ml: f64,
        medium2_ml: f64,
        concentration: f64,
        generations: f64,
    },

    /// A dilution was abandoned because a pump failed.
    DilutionFailed { vial: u8 },

    /// A job failed at the worker boundary.
    JobFailed { job: JobKind },

    /// A job was dropped because its queue slot was occupied.
    JobDropped { job: JobKind },

    /// A culture failed its pre-start check and was left inactive.
    CultureRejected { vial: u8, reason: PolicyViolation },

    /// An experiment started with the given number of active cultures.
    ExperimentStarted { name: String, active_cultures: usize },

    /// The experiment was stopped and all workers drained.
    ExperimentStopped { name: String },
}

/// A point-in-time culture status suitable for logging or transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureStatus {
    pub vial: u8,
    pub policy: PolicyKind,
    pub is_active: bool,
    pub od: Option<f64>,
    pub last_measurement_timestamp: Option<f64>,
    /// Growth rate (1/h).
    pub mu: Option<f64>,
    pub mu_error: Option<f64>,
    /// Doubling time (h).
    pub doubling_time: Option<f64>,
    pub doubling_time_error: Option<f64>,
    pub generations: f64,
    pub current_dose: f64,
    pub drug_concentration: f64,
    pub description: String,
}
