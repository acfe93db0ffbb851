//! Control policies.
//!
//! A closed set of tagged variants sharing the culture's common record and
//! the dilution primitive.  Each variant declares only its own parameters
//! (and, for the patient policy, its treatment state).
//!
//! ```text
//!  batch        never dilutes
//!  chemostat    first: OD > threshold       then: every period (−5 s)
//!  turbidostat  OD > ceiling  AND  elapsed ≥ minimum delay
//!  stress-ramp  turbidostat trigger, target ramps:
//!                 gens < G0      → keep target
//!                 target < S0    → S0
//!                 otherwise      → target · factor
//!  patient      UNTREATED ──[OD > start]──▶ TREATING ──[duration]──▶ POST
//!               dose doubles once in TREATING if OD stays high;
//!               dilutes hourly in every phase
//! ```

use serde::{Deserialize, Serialize};

use super::dilution::Geometry;
use crate::config::{
    ChemostatParams, PatientParams, PolicyConfig, StressRampParams, TurbidostatParams,
};
use crate::error::{ConfigError, PolicyViolation};

/// Chemostat periodic trigger fires this many seconds early so a dilution
/// scheduled on the minute grid is not pushed back a whole minute by pump
/// run time.
pub const CHEMOSTAT_EARLY_TRIGGER_SECS: f64 = 5.0;
/// Turbidostat delay guard is a strict `elapsed ≥ delay` comparison.
pub const TURBIDOSTAT_EARLY_TRIGGER_SECS: f64 = 0.0;
/// Patient cultures are diluted on a fixed hourly period.
pub const PATIENT_DILUTION_PERIOD_MINUTES: f64 = 60.0;
pub const PATIENT_EARLY_TRIGGER_SECS: f64 = 5.0;

/// Policy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    Batch,
    Chemostat,
    Turbidostat,
    StressRamp,
    Patient,
}

impl PolicyKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Chemostat => "chemostat",
            Self::Turbidostat => "turbidostat",
            Self::StressRamp => "stress-ramp",
            Self::Patient => "patient",
        }
    }
}

/// Phase of the patient treatment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TreatmentPhase {
    #[default]
    Untreated,
    Treating,
    PostTreatment,
}

/// Running state of a patient culture.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Treatment {
    pub phase: TreatmentPhase,
    /// Latched true on the first threshold crossing; never cleared.
    pub treatment_started: bool,
    pub treatment_start_time: Option<f64>,
    pub treatment_stop_time: Option<f64>,
    pub dose_increased: bool,
    pub current_dose: f64,
}

/// What a policy sees of its culture when deciding.
#[derive(Debug, Clone, Copy)]
pub struct CultureView {
    pub od: Option<f64>,
    pub last_dilution_timestamp: f64,
    pub dilution_count: u32,
    pub log2_dilution_coefficient: f64,
    pub medium2_concentration_target: f64,
    pub medium2_stock_concentration: f64,
}

impl CultureView {
    fn elapsed_since_dilution(&self, now: f64) -> f64 {
        now - self.last_dilution_timestamp
    }

    fn od_above(&self, limit: f64) -> bool {
        self.od.is_some_and(|od| od > limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Policy {
    Batch,
    Chemostat(ChemostatParams),
    Turbidostat(TurbidostatParams),
    StressRamp(StressRampParams),
    Patient {
        params: PatientParams,
        treatment: Treatment,
    },
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::Batch => Self::Batch,
            PolicyConfig::Chemostat(p) => Self::Chemostat(p.clone()),
            PolicyConfig::Turbidostat(p) => Self::Turbidostat(p.clone()),
            PolicyConfig::StressRamp(p) => Self::StressRamp(p.clone()),
            PolicyConfig::Patient(p) => Self::Patient {
                params: p.clone(),
                treatment: Treatment::default(),
            },
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Batch => PolicyKind::Batch,
            Self::Chemostat(_) => PolicyKind::Chemostat,
            Self::Turbidostat(_) => PolicyKind::Turbidostat,
            Self::StressRamp(_) => PolicyKind::StressRamp,
            Self::Patient { .. } => PolicyKind::Patient,
        }
    }

    /// Decide whether to dilute now.  Returns the drug concentration the
    /// dilution must establish, or `None` to leave the culture alone.
    ///
    /// The patient policy advances its treatment clock here as a side
    /// effect; every other policy is a pure function of the view.
    pub fn decide(&mut self, view: &CultureView, now: f64) -> Option<f64> {
        let elapsed = view.elapsed_since_dilution(now);
        match self {
            Self::Batch => None,

            Self::Chemostat(p) => {
                let due = if view.dilution_count == 0 {
                    view.od_above(p.od_threshold_first_dilution)
                } else {
                    elapsed >= p.dilution_period_minutes * 60.0 - CHEMOSTAT_EARLY_TRIGGER_SECS
                };
                due.then_some(p.medium2_concentration)
            }

            Self::Turbidostat(p) => turbidostat_due(
                view,
                elapsed,
                p.od_max_limit,
                p.minimum_dilution_delay_minutes,
            )
            .then_some(p.medium2_concentration),

            Self::StressRamp(p) => {
                if !turbidostat_due(
                    view,
                    elapsed,
                    p.od_max_limit,
                    p.minimum_dilution_delay_minutes,
                ) {
                    return None;
                }
                let target = if view.log2_dilution_coefficient < p.generations_before_stress {
                    view.medium2_concentration_target
                } else {
                    p.increase_stress(view.medium2_concentration_target)
                };
                Some(target.min(view.medium2_stock_concentration))
            }

            Self::Patient { params, treatment } => {
                advance_treatment(params, treatment, view, now);
                let period = PATIENT_DILUTION_PERIOD_MINUTES * 60.0 - PATIENT_EARLY_TRIGGER_SECS;
                (elapsed >= period).then_some(treatment.current_dose)
            }
        }
    }

    /// Drug concentration a manual dilution should keep in place.
    pub fn maintenance_target(&self, view: &CultureView) -> Option<f64> {
        match self {
            Self::Batch => None,
            Self::Chemostat(p) => Some(p.medium2_concentration),
            Self::Turbidostat(p) => Some(p.medium2_concentration),
            Self::StressRamp(_) => Some(view.medium2_concentration_target),
            Self::Patient { treatment, .. } => Some(treatment.current_dose),
        }
    }

    /// Parameter sanity against the vial geometry.
    pub fn validate(&self, geometry: &Geometry) -> Result<(), PolicyViolation> {
        let stock = geometry.medium2_stock_concentration;
        match self {
            Self::Batch => Ok(()),
            Self::Chemostat(p) => {
                p.validate().map_err(to_violation)?;
                require_stock(stock, p.medium2_concentration)
            }
            Self::Turbidostat(p) => {
                p.validate().map_err(to_violation)?;
                require_stock(stock, p.medium2_concentration)
            }
            Self::StressRamp(p) => {
                p.validate().map_err(to_violation)?;
                if p.stress_increase_factor >= geometry.dilution_factor() {
                    return Err(PolicyViolation::InvalidParameter(
                        "stress_increase_factor must be below the dilution factor",
                    ));
                }
                require_stock(stock, p.initial_stress)
            }
            Self::Patient { params, .. } => {
                params.validate().map_err(to_violation)?;
                require_stock(stock, params.treatment_dose)
            }
        }
    }

    /// Current drug dose (patient policy); zero for every other policy.
    pub fn current_dose(&self) -> f64 {
        match self {
            Self::Patient { treatment, .. } => treatment.current_dose,
            _ => 0.0,
        }
    }

    /// Human-readable one-line description.
    pub fn describe(&self) -> String {
        match self {
            Self::Batch => "batch: measurement only".to_string(),
            Self::Chemostat(p) => format!(
                "chemostat: dilute every {:.0} min once OD > {:.3}, drug {:.3}",
                p.dilution_period_minutes, p.od_threshold_first_dilution, p.medium2_concentration
            ),
            Self::Turbidostat(p) => format!(
                "turbidostat: dilute when OD > {:.3}, at most every {:.1} min",
                p.od_max_limit, p.minimum_dilution_delay_minutes
            ),
            Self::StressRamp(p) => format!(
                "stress-ramp: OD > {:.3}; stress {:.3} after {:.1} generations, x{:.2} per dilution",
                p.od_max_limit, p.initial_stress, p.generations_before_stress, p.stress_increase_factor
            ),
            Self::Patient { params, treatment } => match treatment.phase {
                TreatmentPhase::Untreated => format!(
                    "patient: untreated, treatment starts at OD > {:.3}",
                    params.od_threshold_treatment_start
                ),
                TreatmentPhase::Treating => format!(
                    "patient: treating at dose {:.3} for {:.0} h",
                    treatment.current_dose, params.treatment_duration_hours
                ),
                TreatmentPhase::PostTreatment => {
                    "patient: treatment finished, dilution only".to_string()
                }
            },
        }
    }
}

impl StressRampParams {
    /// Next stress target after `current`: jump to the initial stress,
    /// then grow multiplicatively.
    pub fn increase_stress(&self, current: f64) -> f64 {
        if current < self.initial_stress {
            self.initial_stress
        } else {
            current * self.stress_increase_factor
        }
    }
}

fn turbidostat_due(view: &CultureView, elapsed: f64, od_max: f64, delay_minutes: f64) -> bool {
    view.od_above(od_max) && elapsed >= delay_minutes * 60.0 - TURBIDOSTAT_EARLY_TRIGGER_SECS
}

fn advance_treatment(
    params: &PatientParams,
    treatment: &mut Treatment,
    view: &CultureView,
    now: f64,
) {
    match treatment.phase {
        TreatmentPhase::Untreated => {
            if view.od_above(params.od_threshold_treatment_start) {
                treatment.phase = TreatmentPhase::Treating;
                treatment.treatment_started = true;
                treatment.treatment_start_time = Some(now);
                treatment.current_dose = params.treatment_dose;
                log::info!(
                    "Patient: treatment started at dose {:.3}",
                    treatment.current_dose
                );
            }
        }
        TreatmentPhase::Treating => {
            let start = treatment.treatment_start_time.unwrap_or(now);
            let in_treatment = now - start;
            if in_treatment >= params.treatment_duration_hours * 3600.0 {
                treatment.phase = TreatmentPhase::PostTreatment;
                treatment.treatment_stop_time = Some(now);
                treatment.current_dose = 0.0;
                log::info!("Patient: treatment window closed");
            } else if let Some(threshold) = params.od_threshold_dose_increase {
                if !treatment.dose_increased
                    && in_treatment >= params.dose_increase_delay_hours * 3600.0
                    && view.od_above(threshold)
                {
                    treatment.current_dose *= 2.0;
                    treatment.dose_increased = true;
                    log::info!("Patient: dose doubled to {:.3}", treatment.current_dose);
                }
            }
        }
        TreatmentPhase::PostTreatment => {}
    }
}

fn to_violation(e: ConfigError) -> PolicyViolation {
    match e {
        ConfigError::ValidationFailed(msg) => PolicyViolation::InvalidParameter(msg),
        _ => PolicyViolation::InvalidParameter("unparseable parameter"),
    }
}

fn require_stock(stock: f64, needed: f64) -> Result<(), PolicyViolation> {
    if needed > 0.0 && stock < needed {
        Err(PolicyViolation::InvalidParameter(
            "medium2_stock_concentration is below the requested drug concentration",
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(od: f64, last_dilution: f64) -> CultureView {
        CultureView {
            od: Some(od),
            last_dilution_timestamp: last_dilution,
            dilution_count: 0,
            log2_dilution_coefficient: 0.0,
            medium2_concentration_target: 0.0,
            medium2_stock_concentration: 100.0,
        }
    }

    fn geometry() -> Geometry {
        Geometry {
            dead_volume_ml: 15.0,
            dilution_volume_ml: 10.0,
            medium2_stock_concentration: 100.0,
        }
    }

    #[test]
    fn batch_never_dilutes() {
        let mut p = Policy::Batch;
        assert!(p.decide(&view(5.0, 0.0), 1e9).is_none());
    }

    #[test]
    fn chemostat_first_dilution_waits_for_threshold() {
        let mut p = Policy::Chemostat(ChemostatParams::default());
        assert!(p.decide(&view(0.05, 0.0), 7200.0).is_none());
        assert_eq!(p.decide(&view(0.2, 0.0), 60.0), Some(0.0));
    }

    #[test]
    fn chemostat_periodic_with_early_margin() {
        let mut p = Policy::Chemostat(ChemostatParams::default());
        let mut v = view(0.0, 0.0);
        v.dilution_count = 1;
        assert!(p.decide(&v, 3600.0 - 6.0).is_none());
        assert!(p.decide(&v, 3600.0 - 5.0).is_some());
    }

    #[test]
    fn turbidostat_delay_is_strict() {
        let mut p = Policy::Turbidostat(TurbidostatParams::default());
        assert!(p.decide(&view(0.5, 0.0), 299.9).is_none());
        assert!(p.decide(&view(0.5, 0.0), 300.0).is_some());
        assert!(p.decide(&view(0.3, 0.0), 1000.0).is_none());
    }

    #[test]
    fn turbidostat_without_reading_waits() {
        let mut p = Policy::Turbidostat(TurbidostatParams::default());
        let mut v = view(0.0, 0.0);
        v.od = None;
        assert!(p.decide(&v, 1e6).is_none());
    }

    #[test]
    fn stress_ramp_stages() {
        let params = StressRampParams::default();
        let mut p = Policy::StressRamp(params.clone());
        let mut v = view(0.5, 0.0);

        // Below the generation gate: keep the current target.
        v.log2_dilution_coefficient = 1.0;
        assert_eq!(p.decide(&v, 600.0), Some(0.0));

        // Gate passed: jump to the initial stress.
        v.log2_dilution_coefficient = 3.5;
        assert_eq!(p.decide(&v, 600.0), Some(params.initial_stress));

        // Then grow multiplicatively.
        v.medium2_concentration_target = params.initial_stress;
        let next = p.decide(&v, 600.0).unwrap();
        assert!((next - params.initial_stress * params.stress_increase_factor).abs() < 1e-12);
    }

    #[test]
    fn stress_ramp_target_capped_by_stock() {
        let mut p = Policy::StressRamp(StressRampParams::default());
        let mut v = view(0.5, 0.0);
        v.log2_dilution_coefficient = 10.0;
        v.medium2_concentration_target = 99.0;
        v.medium2_stock_concentration = 100.0;
        assert_eq!(p.decide(&v, 600.0), Some(100.0));
    }

    #[test]
    fn stress_factor_must_stay_below_dilution_factor() {
        let p = Policy::StressRamp(StressRampParams {
            stress_increase_factor: 1.7,
            ..StressRampParams::default()
        });
        assert!(matches!(
            p.validate(&geometry()),
            Err(PolicyViolation::InvalidParameter(_))
        ));
        let ok = Policy::StressRamp(StressRampParams::default());
        assert!(ok.validate(&geometry()).is_ok());
    }

    #[test]
    fn drug_policies_need_enough_stock() {
        let g = Geometry {
            medium2_stock_concentration: 0.5,
            ..geometry()
        };
        let p = Policy::from_config(&PolicyConfig::Patient(PatientParams::default()));
        assert!(p.validate(&g).is_err());
        let turb = Policy::Turbidostat(TurbidostatParams::default());
        assert!(turb.validate(&g).is_ok());
    }

    #[test]
    fn patient_treatment_lifecycle() {
        let params = PatientParams {
            od_threshold_treatment_start: 0.3,
            treatment_dose: 2.0,
            od_threshold_dose_increase: Some(0.4),
            dose_increase_delay_hours: 1.0,
            treatment_duration_hours: 3.0,
        };
        let mut p = Policy::from_config(&PolicyConfig::Patient(params));

        p.decide(&view(0.1, 0.0), 60.0);
        assert_eq!(p.current_dose(), 0.0);

        p.decide(&view(0.35, 0.0), 120.0);
        assert_eq!(p.current_dose(), 2.0);

        // Too early for escalation.
        p.decide(&view(0.5, 0.0), 120.0 + 1800.0);
        assert_eq!(p.current_dose(), 2.0);

        p.decide(&view(0.5, 0.0), 120.0 + 3600.0);
        assert_eq!(p.current_dose(), 4.0);

        // Escalation happens once.
        p.decide(&view(0.6, 0.0), 120.0 + 7200.0);
        assert_eq!(p.current_dose(), 4.0);

        p.decide(&view(0.6, 0.0), 120.0 + 3.0 * 3600.0);
        assert_eq!(p.current_dose(), 0.0);
        match &p {
            Policy::Patient { treatment, .. } => {
                assert_eq!(treatment.phase, TreatmentPhase::PostTreatment);
                assert!(treatment.treatment_started);
                assert!(treatment.treatment_stop_time.is_some());
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn patient_dilutes_hourly_in_every_phase() {
        let mut p = Policy::from_config(&PolicyConfig::Patient(PatientParams::default()));
        assert!(p.decide(&view(0.0, 0.0), 3000.0).is_none());
        assert_eq!(p.decide(&view(0.0, 0.0), 3595.0), Some(0.0));
    }

    #[test]
    fn descriptions_name_the_policy() {
        for (cfg, name) in [
            (PolicyConfig::Batch, "batch"),
            (PolicyConfig::Turbidostat(TurbidostatParams::default()), "turbidostat"),
            (PolicyConfig::StressRamp(StressRampParams::default()), "stress-ramp"),
            (PolicyConfig::Patient(PatientParams::default()), "patient"),
        ] {
            let p = Policy::from_config(&cfg);
            assert!(p.describe().starts_with(name));
            assert_eq!(p.kind().name(), name);
        }
    }
}
