//! Experiment configuration.
//!
//! All tunable parameters for the engine and for every culture policy.
//! Documents are JSON; unknown fields are rejected at parse time and every
//! value is range-checked by `validate()` before an experiment may start.
//! Invalid values are rejected, never clamped.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::app::ports::{StirrerSpeed, VIAL_COUNT};
use crate::culture::growth::OD_HISTORY_SLOTS;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine timing, job table and machine geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    // --- Timing ---
    /// Scheduler tick period (milliseconds).
    pub tick_interval_ms: u64,
    /// Idle poll delay of the operation queue workers (milliseconds).
    pub worker_poll_interval_ms: u64,
    /// Longest wait for a vial or pump lock before reporting contention.
    pub lock_timeout_ms: u64,

    // --- Job table (second within the minute) ---
    pub temperature_offset_secs: u8,
    pub od_offset_secs: u8,
    pub update_offset_secs: u8,
    pub flush_offset_secs: u8,

    // --- Hardware ---
    /// Largest liquid volume a vial holds (mL).
    pub max_vial_volume_ml: f64,
    /// Waste pump volume for the tubing flush (mL).
    pub flush_volume_ml: f64,
    /// Stirrer speed while a culture is running.
    pub stirrer_speed: StirrerSpeed,
    /// Time the culture is left to settle before an OD read (milliseconds).
    pub stirrer_settle_ms: u64,

    // --- Growth estimate ---
    /// Look-back window of the growth-rate regression (minutes).
    pub growth_window_minutes: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            worker_poll_interval_ms: 100,
            lock_timeout_ms: 120_000,

            temperature_offset_secs: 57,
            od_offset_secs: 0,
            update_offset_secs: 30,
            flush_offset_secs: 31,

            max_vial_volume_ml: 35.0,
            flush_volume_ml: 5.0,
            stirrer_speed: StirrerSpeed::High,
            stirrer_settle_ms: 2000,

            growth_window_minutes: 60.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=10_000).contains(&self.tick_interval_ms) {
            return Err(ConfigError::ValidationFailed(
                "tick_interval_ms must be 10–10000",
            ));
        }
        if !(1..=5_000).contains(&self.worker_poll_interval_ms) {
            return Err(ConfigError::ValidationFailed(
                "worker_poll_interval_ms must be 1–5000",
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed("lock_timeout_ms must be > 0"));
        }
        let offsets = [
            self.temperature_offset_secs,
            self.od_offset_secs,
            self.update_offset_secs,
            self.flush_offset_secs,
        ];
        if offsets.iter().any(|o| *o >= 60) {
            return Err(ConfigError::ValidationFailed("job offsets must be 0–59"));
        }
        // Seconds after the temperature slot, wrapping at the minute.
        let after_temperature = |o: u8| (u16::from(o) + 60 - u16::from(offsets[0])) % 60;
        let (od, update, flush) = (
            after_temperature(self.od_offset_secs),
            after_temperature(self.update_offset_secs),
            after_temperature(self.flush_offset_secs),
        );
        if !(0 < od && od < update && update < flush) {
            return Err(ConfigError::ValidationFailed(
                "job offsets must run temperature, OD, update, flush within one minute",
            ));
        }
        if self.od_job_budget_ms() >= u64::from(update - od) * 1000 {
            return Err(ConfigError::ValidationFailed(
                "OD job must finish before the update slot (stirrer_settle_ms too long)",
            ));
        }
        if !(self.max_vial_volume_ml > 0.0 && self.max_vial_volume_ml <= 200.0) {
            return Err(ConfigError::ValidationFailed(
                "max_vial_volume_ml must be in (0, 200]",
            ));
        }
        if !(self.flush_volume_ml >= 0.0 && self.flush_volume_ml <= self.max_vial_volume_ml) {
            return Err(ConfigError::ValidationFailed(
                "flush_volume_ml must be 0–max_vial_volume_ml",
            ));
        }
        if self.stirrer_settle_ms > 30_000 {
            return Err(ConfigError::ValidationFailed(
                "stirrer_settle_ms must be ≤ 30000",
            ));
        }
        if !(self.growth_window_minutes > 0.0
            && self.growth_window_minutes <= OD_HISTORY_SLOTS as f64)
        {
            return Err(ConfigError::ValidationFailed(
                "growth_window_minutes must be in (0, 480]",
            ));
        }
        Ok(())
    }

    /// Settling time the OD job spends across every vial.
    pub fn od_job_budget_ms(&self) -> u64 {
        u64::from(VIAL_COUNT) * self.stirrer_settle_ms
    }
}

// ---------------------------------------------------------------------------
// Policy parameters
// ---------------------------------------------------------------------------

/// Periodic dilution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChemostatParams {
    pub dilution_period_minutes: f64,
    /// OD that triggers the very first dilution.
    pub od_threshold_first_dilution: f64,
    /// Drug concentration restored by every dilution.
    pub medium2_concentration: f64,
}

impl Default for ChemostatParams {
    fn default() -> Self {
        Self {
            dilution_period_minutes: 60.0,
            od_threshold_first_dilution: 0.1,
            medium2_concentration: 0.0,
        }
    }
}

impl ChemostatParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dilution_period_minutes >= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "dilution_period_minutes must be ≥ 1",
            ));
        }
        if !(self.od_threshold_first_dilution >= 0.0) {
            return Err(ConfigError::ValidationFailed(
                "od_threshold_first_dilution must be ≥ 0",
            ));
        }
        validate_concentration(self.medium2_concentration)
    }
}

/// Dilute whenever OD exceeds a ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TurbidostatParams {
    pub od_max_limit: f64,
    pub minimum_dilution_delay_minutes: f64,
    pub medium2_concentration: f64,
}

impl Default for TurbidostatParams {
    fn default() -> Self {
        Self {
            od_max_limit: 0.3,
            minimum_dilution_delay_minutes: 5.0,
            medium2_concentration: 0.0,
        }
    }
}

impl TurbidostatParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_od_limit(self.od_max_limit)?;
        validate_delay(self.minimum_dilution_delay_minutes)?;
        validate_concentration(self.medium2_concentration)
    }
}

/// Turbidostat whose drug target ramps up once the culture is established
/// (morbidostat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StressRampParams {
    pub od_max_limit: f64,
    pub minimum_dilution_delay_minutes: f64,
    /// Generations to grow drug-free before stress is applied.
    pub generations_before_stress: f64,
    /// First stress target (drug concentration).
    pub initial_stress: f64,
    /// Multiplier applied to the stress target on every later dilution.
    pub stress_increase_factor: f64,
}

impl Default for StressRampParams {
    fn default() -> Self {
        Self {
            od_max_limit: 0.3,
            minimum_dilution_delay_minutes: 5.0,
            generations_before_stress: 3.0,
            initial_stress: 1.0,
            stress_increase_factor: 1.1,
        }
    }
}

impl StressRampParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_od_limit(self.od_max_limit)?;
        validate_delay(self.minimum_dilution_delay_minutes)?;
        if !(self.generations_before_stress >= 0.0) {
            return Err(ConfigError::ValidationFailed(
                "generations_before_stress must be ≥ 0",
            ));
        }
        if !(self.initial_stress > 0.0 && self.initial_stress.is_finite()) {
            return Err(ConfigError::ValidationFailed("initial_stress must be > 0"));
        }
        if !(self.stress_increase_factor > 1.0 && self.stress_increase_factor.is_finite()) {
            return Err(ConfigError::ValidationFailed(
                "stress_increase_factor must be > 1",
            ));
        }
        Ok(())
    }
}

/// Simulated patient dosing: a timed treatment window triggered by OD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatientParams {
    pub od_threshold_treatment_start: f64,
    pub treatment_dose: f64,
    /// OD above which the dose doubles once `dose_increase_delay_hours`
    /// into the treatment.  `None` disables dose escalation.
    pub od_threshold_dose_increase: Option<f64>,
    pub dose_increase_delay_hours: f64,
    pub treatment_duration_hours: f64,
}

impl Default for PatientParams {
    fn default() -> Self {
        Self {
            od_threshold_treatment_start: 0.3,
            treatment_dose: 1.0,
            od_threshold_dose_increase: None,
            dose_increase_delay_hours: 24.0,
            treatment_duration_hours: 72.0,
        }
    }
}

impl PatientParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_od_limit(self.od_threshold_treatment_start)?;
        if !(self.treatment_dose > 0.0 && self.treatment_dose.is_finite()) {
            return Err(ConfigError::ValidationFailed("treatment_dose must be > 0"));
        }
        if let Some(t) = self.od_threshold_dose_increase {
            validate_od_limit(t)?;
        }
        if !(self.treatment_duration_hours > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "treatment_duration_hours must be > 0",
            ));
        }
        if !(self.dose_increase_delay_hours >= 0.0
            && self.dose_increase_delay_hours < self.treatment_duration_hours)
        {
            return Err(ConfigError::ValidationFailed(
                "dose_increase_delay_hours must be 0–treatment_duration_hours",
            ));
        }
        Ok(())
    }
}

fn validate_od_limit(od: f64) -> Result<(), ConfigError> {
    if od > 0.0 && od <= 10.0 {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed("OD thresholds must be in (0, 10]"))
    }
}

fn validate_delay(minutes: f64) -> Result<(), ConfigError> {
    if (0.0..=24.0 * 60.0).contains(&minutes) {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(
            "minimum_dilution_delay_minutes must be 0–1440",
        ))
    }
}

fn validate_concentration(c: f64) -> Result<(), ConfigError> {
    if c >= 0.0 && c.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(
            "medium2_concentration must be ≥ 0",
        ))
    }
}

/// Control policy attached to a vial.  Each variant carries only the
/// fields its policy needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyConfig {
    Batch,
    Chemostat(ChemostatParams),
    Turbidostat(TurbidostatParams),
    StressRamp(StressRampParams),
    Patient(PatientParams),
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Batch => Ok(()),
            Self::Chemostat(p) => p.validate(),
            Self::Turbidostat(p) => p.validate(),
            Self::StressRamp(p) => p.validate(),
            Self::Patient(p) => p.validate(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cultures and experiments
// ---------------------------------------------------------------------------

/// One culture: the vial, its liquid geometry and its policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CultureConfig {
    pub vial: u8,
    #[serde(default = "default_dead_volume")]
    pub dead_volume_ml: f64,
    #[serde(default = "default_dilution_volume")]
    pub default_dilution_volume_ml: f64,
    /// Drug concentration of the medium-2 bottle.
    #[serde(default)]
    pub medium2_stock_concentration: f64,
    pub policy: PolicyConfig,
}

fn default_dead_volume() -> f64 {
    15.0
}

fn default_dilution_volume() -> f64 {
    10.0
}

impl CultureConfig {
    pub fn validate(&self, max_vial_volume_ml: f64) -> Result<(), ConfigError> {
        if self.vial == 0 || self.vial > VIAL_COUNT {
            return Err(ConfigError::ValidationFailed("vial must be 1–7"));
        }
        if !(self.dead_volume_ml > 0.0) {
            return Err(ConfigError::ValidationFailed("dead_volume_ml must be > 0"));
        }
        if !(self.default_dilution_volume_ml > 0.0
            && self.default_dilution_volume_ml <= max_vial_volume_ml - self.dead_volume_ml)
        {
            return Err(ConfigError::ValidationFailed(
                "default_dilution_volume_ml must be in (0, max_vial_volume_ml - dead_volume_ml]",
            ));
        }
        if !(self.medium2_stock_concentration >= 0.0 && self.medium2_stock_concentration.is_finite())
        {
            return Err(ConfigError::ValidationFailed(
                "medium2_stock_concentration must be ≥ 0",
            ));
        }
        self.policy.validate()
    }
}

/// A complete experiment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub engine: EngineConfig,
    pub cultures: Vec<CultureConfig>,
}

impl ExperimentConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("name must not be empty"));
        }
        self.engine.validate()?;
        let mut seen = [false; VIAL_COUNT as usize + 1];
        for culture in &self.cultures {
            culture.validate(self.engine.max_vial_volume_ml)?;
            let slot = &mut seen[culture.vial as usize];
            if *slot {
                return Err(ConfigError::ValidationFailed("each vial may appear only once"));
            }
            *slot = true;
        }
        Ok(())
    }
}
