//! Simulated bioreactor.
//!
//! Implements [`DevicePort`] with a per-vial logistic growth model so the
//! engine can run end to end without hardware (`--simulate`).  Time is
//! taken from the injected clock, so a [`ManualClock`] run is fully
//! deterministic.
//!
//! - Growth: `dOD/dt = μ·OD·(1 − OD/K)` with `μ = μ_max / (1 + c/IC50)`,
//!   integrated in closed form between calls.
//! - Dilution: medium pumps scale OD and drug by `dead / (dead + V)`.
//! - Faults: the next `n` OD reads of a vial, or dispenses of a pump, can
//!   be made to fail.
//!
//! [`ManualClock`]: super::time::ManualClock

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};

use crate::app::ports::{ClockPort, DevicePort, PumpId, StirrerSpeed, VIAL_COUNT};
use crate::error::DeviceError;

/// Model parameters shared by every vial.
#[derive(Debug, Clone)]
pub struct SimParams {
    /// Maximum growth rate (1/h).
    pub mu_max: f64,
    /// Carrying capacity (OD).
    pub carrying_capacity: f64,
    /// Drug concentration halving the growth rate.
    pub ic50: f64,
    /// Liquid left in a vial after the waste needle (mL).
    pub dead_volume_ml: f64,
    pub initial_od: f64,
    /// Drug concentration of the medium-2 reservoir.
    pub medium2_stock_concentration: f64,
    /// Wall-clock time each device call takes.
    pub call_latency: Duration,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            mu_max: 0.8,
            carrying_capacity: 1.5,
            ic50: 2.0,
            dead_volume_ml: 15.0,
            initial_od: 0.05,
            medium2_stock_concentration: 0.0,
            call_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct SimVial {
    od: f64,
    drug: f64,
    stirrer: StirrerSpeed,
    last_update: Option<f64>,
}

struct SimState {
    connected: bool,
    vials: Vec<SimVial>,
    od_faults: HashMap<u8, u32>,
    dispense_faults: HashMap<PumpId, u32>,
    uncalibrated: Vec<u8>,
    dispensed_ml: HashMap<PumpId, f64>,
}

pub struct SimulatedDevice {
    clock: Arc<dyn ClockPort>,
    params: SimParams,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(clock: Arc<dyn ClockPort>, params: SimParams) -> Self {
        let vial = SimVial {
            od: params.initial_od,
            drug: 0.0,
            stirrer: StirrerSpeed::Stopped,
            last_update: None,
        };
        Self {
            clock,
            state: Mutex::new(SimState {
                connected: false,
                vials: vec![vial; usize::from(VIAL_COUNT)],
                od_faults: HashMap::new(),
                dispense_faults: HashMap::new(),
                uncalibrated: Vec::new(),
                dispensed_ml: HashMap::new(),
            }),
            params,
        }
    }

    // ── Fault injection ───────────────────────────────────────

    pub fn fail_next_od_reads(&self, vial: u8, count: u32) {
        self.state().od_faults.insert(vial, count);
    }

    pub fn fail_next_dispenses(&self, pump: PumpId, count: u32) {
        self.state().dispense_faults.insert(pump, count);
    }

    pub fn set_uncalibrated(&self, vial: u8) {
        self.state().uncalibrated.push(vial);
    }

    // ── Inspection ────────────────────────────────────────────

    /// Modelled OD right now, without a read.
    pub fn true_od(&self, vial: u8) -> Option<f64> {
        let now = self.clock.now();
        let mut state = self.state();
        let v = state.vials.get_mut(usize::from(vial.checked_sub(1)?))?;
        self.advance(v, now);
        Some(v.od)
    }

    pub fn stirrer(&self, vial: u8) -> Option<StirrerSpeed> {
        let state = self.state();
        state
            .vials
            .get(usize::from(vial.checked_sub(1)?))
            .map(|v| v.stirrer)
    }

    /// Total volume pumped through `pump` so far (mL).
    pub fn dispensed_ml(&self, pump: PumpId) -> f64 {
        self.state().dispensed_ml.get(&pump).copied().unwrap_or(0.0)
    }

    // ── Internal ──────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn latency(&self) {
        if !self.params.call_latency.is_zero() {
            std::thread::sleep(self.params.call_latency);
        }
    }

    /// Logistic growth from the vial's last update to `now`.
    fn advance(&self, v: &mut SimVial, now: f64) {
        let last = v.last_update.replace(now).unwrap_or(now);
        let hours = ((now - last) / 3600.0).max(0.0);
        if hours == 0.0 || v.od <= 0.0 {
            return;
        }
        let p = &self.params;
        let mu = p.mu_max / (1.0 + v.drug / p.ic50);
        let k = p.carrying_capacity;
        let growth = (mu * hours).exp();
        v.od = k * v.od * growth / (k + v.od * (growth - 1.0));
    }

    fn check_connected(state: &SimState) -> Result<(), DeviceError> {
        if state.connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn vial_index(vial: u8) -> Option<usize> {
        (1..=VIAL_COUNT)
            .contains(&vial)
            .then(|| usize::from(vial - 1))
    }
}

fn take_fault<K: Eq + std::hash::Hash>(faults: &mut HashMap<K, u32>, key: &K) -> bool {
    match faults.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl DevicePort for SimulatedDevice {
    fn connect(&self) -> Result<(), DeviceError> {
        self.state().connected = true;
        info!("SimulatedDevice: connected ({} vials)", VIAL_COUNT);
        Ok(())
    }

    fn disconnect(&self) {
        self.state().connected = false;
        info!("SimulatedDevice: disconnected");
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn is_calibrated(&self, vial: u8) -> bool {
        Self::vial_index(vial).is_some() && !self.state().uncalibrated.contains(&vial)
    }

    fn read_od(&self, vial: u8) -> Result<f64, DeviceError> {
        self.latency();
        let now = self.clock.now();
        let mut state = self.state();
        Self::check_connected(&state)?;
        let idx = Self::vial_index(vial).ok_or(DeviceError::OdReadFailed(vial))?;
        if take_fault(&mut state.od_faults, &vial) {
            return Err(DeviceError::OdReadFailed(vial));
        }
        let v = &mut state.vials[idx];
        self.advance(v, now);
        debug!("SimulatedDevice: vial {} OD {:.4}", vial, v.od);
        Ok(v.od)
    }

    fn read_temperature(&self) -> Result<(f64, f64), DeviceError> {
        self.latency();
        let state = self.state();
        Self::check_connected(&state)?;
        Ok((37.0, 30.5))
    }

    fn dispense(&self, vial: u8, pump: PumpId, volume_ml: f64) -> Result<(), DeviceError> {
        self.latency();
        let now = self.clock.now();
        let mut state = self.state();
        Self::check_connected(&state)?;
        let idx = Self::vial_index(vial).ok_or(DeviceError::DispenseFailed(pump))?;
        if take_fault(&mut state.dispense_faults, &pump) {
            return Err(DeviceError::DispenseFailed(pump));
        }
        *state.dispensed_ml.entry(pump).or_insert(0.0) += volume_ml;

        let dead = self.params.dead_volume_ml;
        let stock = self.params.medium2_stock_concentration;
        let v = &mut state.vials[idx];
        self.advance(v, now);
        match pump {
            PumpId::Medium1 | PumpId::Medium2 => {
                let added = if pump == PumpId::Medium2 { stock * volume_ml } else { 0.0 };
                let total = dead + volume_ml;
                v.od *= dead / total;
                v.drug = (v.drug * dead + added) / total;
            }
            // Excess above the dead volume is removed; concentrations hold.
            PumpId::Waste => {}
        }
        Ok(())
    }

    fn set_stirrer_speed(&self, vial: u8, speed: StirrerSpeed) -> Result<(), DeviceError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        let idx = Self::vial_index(vial).ok_or(DeviceError::StirrerFailed(vial))?;
        state.vials[idx].stirrer = speed;
        Ok(())
    }
}
