//! Mock bioreactor for integration tests.
//!
//! Records every device call so tests can assert on the full command
//! history, serves scripted OD values, and tracks how many calls touch a
//! vial or the pump manifold at the same time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use replifactory::app::events::AppEvent;
use replifactory::app::ports::{DevicePort, EventSink, PumpId, StirrerSpeed, VIAL_COUNT};
use replifactory::config::{CultureConfig, EngineConfig, PolicyConfig, TurbidostatParams};
use replifactory::error::DeviceError;

/// Second 0 of a minute.
pub const T0: f64 = 1_699_999_980.0;

// ── Device call record ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    ReadOd(u8),
    ReadTemperature,
    Dispense { vial: u8, pump: PumpId, volume_ml: f64 },
    Stirrer { vial: u8, speed: StirrerSpeed },
}

// ── MockDevice ────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    connected: bool,
    calls: Vec<DeviceCall>,
    od: HashMap<u8, f64>,
    failing_od: HashSet<u8>,
    failing_pumps: HashSet<PumpId>,
    uncalibrated: HashSet<u8>,
}

pub struct MockDevice {
    state: Mutex<MockState>,
    latency: Duration,
    in_flight_vials: [AtomicUsize; VIAL_COUNT as usize + 1],
    in_flight_pumps: AtomicUsize,
    max_vial_overlap: AtomicUsize,
    max_pump_overlap: AtomicUsize,
}

#[allow(dead_code)]
impl MockDevice {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every call sleeps for `latency`, widening overlap windows.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            }),
            latency,
            in_flight_vials: Default::default(),
            in_flight_pumps: AtomicUsize::new(0),
            max_vial_overlap: AtomicUsize::new(0),
            max_pump_overlap: AtomicUsize::new(0),
        }
    }

    pub fn set_od(&self, vial: u8, od: f64) {
        self.state.lock().unwrap().od.insert(vial, od);
    }

    pub fn fail_od(&self, vial: u8) {
        self.state.lock().unwrap().failing_od.insert(vial);
    }

    pub fn fail_pump(&self, pump: PumpId) {
        self.state.lock().unwrap().failing_pumps.insert(pump);
    }

    pub fn heal(&self) {
        let mut s = self.state.lock().unwrap();
        s.failing_od.clear();
        s.failing_pumps.clear();
    }

    pub fn set_uncalibrated(&self, vial: u8) {
        self.state.lock().unwrap().uncalibrated.insert(vial);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn dispenses(&self) -> Vec<(u8, PumpId, f64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Dispense {
                    vial,
                    pump,
                    volume_ml,
                } => Some((vial, pump, volume_ml)),
                _ => None,
            })
            .collect()
    }

    pub fn od_reads(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::ReadOd(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn last_stirrer(&self, vial: u8) -> Option<StirrerSpeed> {
        self.calls().into_iter().rev().find_map(|c| match c {
            DeviceCall::Stirrer { vial: v, speed } if v == vial => Some(speed),
            _ => None,
        })
    }

    /// Most calls ever seen in flight on one vial at once.
    pub fn max_vial_overlap(&self) -> usize {
        self.max_vial_overlap.load(Ordering::SeqCst)
    }

    /// Most pump calls ever seen in flight at once.
    pub fn max_pump_overlap(&self) -> usize {
        self.max_pump_overlap.load(Ordering::SeqCst)
    }

    fn record(&self, call: DeviceCall) -> Result<(), DeviceError> {
        let mut s = self.state.lock().unwrap();
        if !s.connected {
            return Err(DeviceError::NotConnected);
        }
        s.calls.push(call);
        Ok(())
    }

    fn enter_vial(&self, vial: u8) {
        let n = self.in_flight_vials[vial as usize].fetch_add(1, Ordering::SeqCst) + 1;
        self.max_vial_overlap.fetch_max(n, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }

    fn leave_vial(&self, vial: u8) {
        self.in_flight_vials[vial as usize].fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePort for MockDevice {
    fn connect(&self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn is_calibrated(&self, vial: u8) -> bool {
        (1..=VIAL_COUNT).contains(&vial) && !self.state.lock().unwrap().uncalibrated.contains(&vial)
    }

    fn read_od(&self, vial: u8) -> Result<f64, DeviceError> {
        self.enter_vial(vial);
        let result = self.record(DeviceCall::ReadOd(vial)).and_then(|()| {
            let s = self.state.lock().unwrap();
            if s.failing_od.contains(&vial) {
                Err(DeviceError::OdReadFailed(vial))
            } else {
                Ok(s.od.get(&vial).copied().unwrap_or(0.05))
            }
        });
        self.leave_vial(vial);
        result
    }

    fn read_temperature(&self) -> Result<(f64, f64), DeviceError> {
        self.record(DeviceCall::ReadTemperature)?;
        Ok((37.0, 31.0))
    }

    fn dispense(&self, vial: u8, pump: PumpId, volume_ml: f64) -> Result<(), DeviceError> {
        let pumps = self.in_flight_pumps.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_pump_overlap.fetch_max(pumps, Ordering::SeqCst);
        self.enter_vial(vial);
        let result = self
            .record(DeviceCall::Dispense {
                vial,
                pump,
                volume_ml,
            })
            .and_then(|()| {
                if self.state.lock().unwrap().failing_pumps.contains(&pump) {
                    Err(DeviceError::DispenseFailed(pump))
                } else {
                    Ok(())
                }
            });
        self.leave_vial(vial);
        self.in_flight_pumps.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn set_stirrer_speed(&self, vial: u8, speed: StirrerSpeed) -> Result<(), DeviceError> {
        self.record(DeviceCall::Stirrer { vial, speed })
    }
}

// ── RecordingSink ─────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AppEvent>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn events(&self) -> Vec<AppEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &AppEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ── Fixtures ──────────────────────────────────────────────────

/// Engine settings that keep tests fast.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 10,
        worker_poll_interval_ms: 1,
        lock_timeout_ms: 2_000,
        stirrer_settle_ms: 0,
        ..EngineConfig::default()
    }
}

pub fn turbidostat(vial: u8, od_max_limit: f64) -> CultureConfig {
    CultureConfig {
        vial,
        dead_volume_ml: 15.0,
        default_dilution_volume_ml: 10.0,
        medium2_stock_concentration: 0.0,
        policy: PolicyConfig::Turbidostat(TurbidostatParams {
            od_max_limit,
            minimum_dilution_delay_minutes: 5.0,
            medium2_concentration: 0.0,
        }),
    }
}

/// Poll `cond` until it holds; panics after five seconds.
#[allow(dead_code)]
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
