//! Per-vial culture state machine.
//!
//! One [`Culture`] per attached vial.  The measurement worker feeds it OD
//! readings through [`Culture::record_od`]; the culture-update job calls
//! [`Culture::update`], the sole decision entry point, which returns at
//! most one [`DilutionRequest`].  The request is committed back with
//! [`Culture::commit_dilution`] only after the pumps report success, or
//! released with [`Culture::abort_dilution`] on failure.
//!
//! ```text
//!   record_od ──▶ od, history, growth
//!                        │
//!   update(now) ─────────┴──▶ Policy::decide ──▶ dilution::plan ──▶ request
//!                                                                     │
//!   commit_dilution ◀──────────── pumps OK ◀──────────────────────────┘
//! ```

pub mod dilution;
pub mod growth;
pub mod policy;

use serde::{Deserialize, Serialize};

use crate::app::events::CultureStatus;
use crate::app::ports::{DevicePort, VIAL_COUNT};
use crate::config::CultureConfig;
use crate::error::{PolicyViolation, SnapshotError};
use dilution::{DilutionRequest, Geometry};
use growth::{GrowthEstimate, OdHistory, OdSample};
use policy::{CultureView, Policy, PolicyKind};

/// Default look-back of the growth-rate regression (seconds).
const DEFAULT_GROWTH_WINDOW_SECS: f64 = 3600.0;

/// Persisted running state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CultureState {
    pub is_active: bool,
    pub od: Option<f64>,
    pub last_measurement_timestamp: Option<f64>,
    /// Experiment start counts as the first "dilution".
    pub last_dilution_timestamp: f64,
    /// Generations induced by dilution.  Never decreases.
    pub log2_dilution_coefficient: f64,
    pub dilution_count: u32,
    pub medium2_concentration_target: f64,
    /// Estimated drug concentration currently in the vial.
    pub drug_concentration: f64,
}

/// Serializable image of a culture: identity, parameters and running
/// state.  Transient fields (history, growth estimate, pending flag) are
/// not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureSnapshot {
    pub vial: u8,
    pub geometry: Geometry,
    pub policy: Policy,
    pub state: CultureState,
}

#[derive(Debug, Clone)]
pub struct Culture {
    vial: u8,
    geometry: Geometry,
    policy: Policy,
    state: CultureState,

    // -- Transient --
    history: OdHistory,
    growth: Option<GrowthEstimate>,
    growth_window_secs: f64,
    dilution_pending: bool,
}

impl Culture {
    pub fn new(config: &CultureConfig) -> Self {
        Self {
            vial: config.vial,
            geometry: Geometry {
                dead_volume_ml: config.dead_volume_ml,
                dilution_volume_ml: config.default_dilution_volume_ml,
                medium2_stock_concentration: config.medium2_stock_concentration,
            },
            policy: Policy::from_config(&config.policy),
            state: CultureState::default(),
            history: OdHistory::new(),
            growth: None,
            growth_window_secs: DEFAULT_GROWTH_WINDOW_SECS,
            dilution_pending: false,
        }
    }

    /// Set the look-back of the growth-rate regression.
    #[must_use]
    pub fn with_growth_window_minutes(mut self, minutes: f64) -> Self {
        self.growth_window_secs = minutes * 60.0;
        self
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Validate device connectivity, vial range, calibration and
    /// parameter sanity.  Any failure is fatal to starting the culture.
    pub fn check(
        &self,
        device: &dyn DevicePort,
        max_vial_volume_ml: f64,
    ) -> Result<(), PolicyViolation> {
        if !device.is_connected() {
            return Err(PolicyViolation::DeviceDisconnected);
        }
        if self.vial == 0 || self.vial > VIAL_COUNT {
            return Err(PolicyViolation::VialOutOfRange(self.vial));
        }
        if !device.is_calibrated(self.vial) {
            return Err(PolicyViolation::MissingCalibration(self.vial));
        }
        let g = &self.geometry;
        if !(g.dead_volume_ml > 0.0) {
            return Err(PolicyViolation::InvalidParameter("dead_volume_ml must be > 0"));
        }
        if !(g.dilution_volume_ml > 0.0
            && g.dilution_volume_ml <= max_vial_volume_ml - g.dead_volume_ml)
        {
            return Err(PolicyViolation::InvalidParameter(
                "dilution volume exceeds the vial capacity above the dead volume",
            ));
        }
        self.policy.validate(g)
    }

    /// Arm the culture.  A culture that has never been diluted treats the
    /// activation time as its last dilution.
    pub fn activate(&mut self, now: f64) {
        if self.state.dilution_count == 0 {
            self.state.last_dilution_timestamp = now;
        }
        self.state.is_active = true;
        self.dilution_pending = false;
    }

    pub fn deactivate(&mut self) {
        self.state.is_active = false;
    }

    // ── Measurement ───────────────────────────────────────────

    /// Store a fresh OD reading and refresh the growth estimate.
    /// Returns `false` (and stores nothing) for a non-finite reading.
    pub fn record_od(&mut self, timestamp: f64, od: f64) -> bool {
        if !od.is_finite() || !timestamp.is_finite() {
            log::warn!("Culture {}: discarding non-finite OD reading", self.vial);
            return false;
        }
        let od = od.max(0.0);
        self.state.od = Some(od);
        self.state.last_measurement_timestamp = Some(timestamp);
        self.history.push(OdSample { timestamp, od });
        self.compute_growth_rate(timestamp);
        true
    }

    /// Estimate μ and doubling time from readings inside the growth
    /// window that postdate the last dilution.  `None` when unknown.
    pub fn compute_growth_rate(&mut self, now: f64) -> Option<GrowthEstimate> {
        self.growth = growth::estimate(
            self.history.iter(),
            now - self.growth_window_secs,
            self.state.last_dilution_timestamp,
        );
        self.growth
    }

    // ── Decision ──────────────────────────────────────────────

    /// Decide on this tick.  Returns at most one dilution request; a
    /// culture that is inactive or already has a request in flight
    /// returns `None`.
    pub fn update(&mut self, now: f64) -> Option<DilutionRequest> {
        if !self.state.is_active || self.dilution_pending {
            return None;
        }
        let view = self.view();
        let target = self.policy.decide(&view, now)?;
        Some(self.issue(target, now))
    }

    /// Manual override: dilute now, keeping the policy's drug target.
    pub fn force_dilution(&mut self, now: f64) -> Option<DilutionRequest> {
        if !self.state.is_active || self.dilution_pending {
            return None;
        }
        let target = self.policy.maintenance_target(&self.view())?;
        Some(self.issue(target, now))
    }

    fn issue(&mut self, target: f64, now: f64) -> DilutionRequest {
        let request = dilution::plan(
            self.vial,
            &self.geometry,
            self.state.drug_concentration,
            target,
            now,
        );
        self.dilution_pending = true;
        log::debug!(
            "Culture {}: dilution requested ({:.2} mL medium1, {:.2} mL medium2)",
            self.vial,
            request.medium1_ml,
            request.medium2_ml
        );
        request
    }

    /// Apply a dilution the pumps completed.
    pub fn commit_dilution(&mut self, request: &DilutionRequest) {
        debug_assert_eq!(request.vial, self.vial);
        self.state.last_dilution_timestamp = request.requested_at;
        self.state.log2_dilution_coefficient += request.generations.max(0.0);
        self.state.dilution_count += 1;
        self.state.medium2_concentration_target = request.target_concentration;
        self.state.drug_concentration = request.resulting_concentration;
        self.dilution_pending = false;
    }

    /// Release a dilution the pumps failed; state stays as it was.
    pub fn abort_dilution(&mut self) {
        self.dilution_pending = false;
    }

    fn view(&self) -> CultureView {
        CultureView {
            od: self.state.od,
            last_dilution_timestamp: self.state.last_dilution_timestamp,
            dilution_count: self.state.dilution_count,
            log2_dilution_coefficient: self.state.log2_dilution_coefficient,
            medium2_concentration_target: self.state.medium2_concentration_target,
            medium2_stock_concentration: self.geometry.medium2_stock_concentration,
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn vial(&self) -> u8 {
        self.vial
    }

    pub fn kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn state(&self) -> &CultureState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active
    }

    pub fn is_dilution_pending(&self) -> bool {
        self.dilution_pending
    }

    /// Recent readings, oldest first; bounded by
    /// [`growth::OD_HISTORY_SLOTS`].
    pub fn od_history(&self) -> &OdHistory {
        &self.history
    }

    pub fn growth(&self) -> Option<GrowthEstimate> {
        self.growth
    }

    pub fn describe(&self) -> String {
        self.policy.describe()
    }

    pub fn status(&self) -> CultureStatus {
        CultureStatus {
            vial: self.vial,
            policy: self.kind(),
            is_active: self.state.is_active,
            od: self.state.od,
            last_measurement_timestamp: self.state.last_measurement_timestamp,
            mu: self.growth.map(|g| g.mu),
            mu_error: self.growth.and_then(|g| g.mu_error),
            doubling_time: self.growth.and_then(|g| g.doubling_time),
            doubling_time_error: self.growth.and_then(|g| g.doubling_time_error),
            generations: self.state.log2_dilution_coefficient,
            current_dose: self.policy.current_dose(),
            drug_concentration: self.state.drug_concentration,
            description: self.describe(),
        }
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn snapshot(&self) -> CultureSnapshot {
        CultureSnapshot {
            vial: self.vial,
            geometry: self.geometry,
            policy: self.policy.clone(),
            state: self.state.clone(),
        }
    }

    /// Rebuild a culture of the `expected` policy from a snapshot.
    pub fn from_snapshot(
        expected: PolicyKind,
        snapshot: CultureSnapshot,
    ) -> Result<Self, SnapshotError> {
        let found = snapshot.policy.kind();
        if found != expected {
            return Err(SnapshotError::PolicyMismatch {
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(Self {
            vial: snapshot.vial,
            geometry: snapshot.geometry,
            policy: snapshot.policy,
            state: snapshot.state,
            history: OdHistory::new(),
            growth: None,
            growth_window_secs: DEFAULT_GROWTH_WINDOW_SECS,
            dilution_pending: false,
        })
    }
}
