//! End-to-end tests through the [`ExperimentManager`] with real scheduler
//! and worker threads, a manual clock and the mock bioreactor.

use std::sync::Arc;
use std::time::Duration;

use replifactory::adapters::file_store::FileStore;
use replifactory::adapters::memory_store::MemoryStore;
use replifactory::adapters::time::ManualClock;
use replifactory::app::commands::AppCommand;
use replifactory::app::events::AppEvent;
use replifactory::app::ports::{PumpId, StirrerSpeed};
use replifactory::app::service::ExperimentManager;
use replifactory::config::{CultureConfig, ExperimentConfig};
use replifactory::error::{Error, PolicyViolation};
use replifactory::persistence;

use super::mock_hw::{MockDevice, RecordingSink, T0, fast_engine, turbidostat, wait_until};

struct Rig {
    clock: Arc<ManualClock>,
    mock: Arc<MockDevice>,
    sink: Arc<RecordingSink>,
    store: Arc<MemoryStore>,
    manager: ExperimentManager,
}

fn start(mock: MockDevice, cultures: Vec<CultureConfig>) -> Rig {
    let clock = Arc::new(ManualClock::new(T0));
    let mock = Arc::new(mock);
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(MemoryStore::new());
    let manager =
        ExperimentManager::new(clock.clone(), sink.clone()).with_storage(store.clone());
    manager.set_device(mock.clone()).unwrap();
    manager.connect_device().unwrap();
    manager
        .set_current_experiment(ExperimentConfig {
            name: "lifecycle".into(),
            engine: fast_engine(),
            cultures,
        })
        .unwrap();
    manager.start_experiment().unwrap();
    Rig {
        clock,
        mock,
        sink,
        store,
        manager,
    }
}

impl Rig {
    /// Move the clock to `t` and wait for a full tick at that time and
    /// for both queues to drain.
    fn step_to(&self, t: f64) {
        self.clock.set(t);
        let ticks = self.ticks();
        wait_until("scheduler tick", || self.ticks() >= ticks + 2);
        assert!(self.manager.wait_idle(Duration::from_secs(5)));
    }

    /// Visit every job offset of minute `m` in order.
    fn run_minute(&self, m: u32) {
        for offset in [0.0, 30.0, 31.0, 57.0] {
            self.step_to(T0 + 60.0 * f64::from(m) + offset);
        }
    }

    fn ticks(&self) -> u64 {
        self.manager.metrics().map_or(0, |m| m.scheduler_ticks)
    }
}

fn waste_dispensed(mock: &MockDevice) -> bool {
    mock.dispenses().iter().any(|(_, p, _)| *p == PumpId::Waste)
}

#[test]
fn measure_dilute_then_flush() {
    let mock = MockDevice::new();
    mock.set_od(1, 0.5);
    let r = start(mock, vec![turbidostat(1, 0.3)]);

    // Inside the five-minute minimum delay: measure only.
    for m in 0..5 {
        r.run_minute(m);
    }
    assert!(r.mock.od_reads().len() >= 5);
    assert!(r.mock.dispenses().is_empty());

    // 5 min 30 s: dilute, then flush one second later.
    r.step_to(T0 + 330.0);
    assert_eq!(r.mock.dispenses(), vec![(1, PumpId::Medium1, 10.0)]);
    r.step_to(T0 + 331.0);
    assert!(waste_dispensed(&r.mock));

    let status = r.manager.culture_status(1).unwrap();
    assert!(status.generations > 0.0);
    assert_eq!(
        r.sink
            .count(|e| matches!(e, AppEvent::DilutionPerformed { vial: 1, .. })),
        1
    );
}

#[test]
fn vial_and_pump_access_is_exclusive() {
    let mock = MockDevice::with_latency(Duration::from_millis(2));
    for vial in 1..=3 {
        mock.set_od(vial, 0.8);
    }
    let cultures = (1..=3)
        .map(|v| CultureConfig {
            policy: replifactory::config::PolicyConfig::Turbidostat(
                replifactory::config::TurbidostatParams {
                    od_max_limit: 0.3,
                    minimum_dilution_delay_minutes: 0.0,
                    medium2_concentration: 0.0,
                },
            ),
            ..turbidostat(v, 0.3)
        })
        .collect();
    let r = start(mock, cultures);

    for minute in 1..=4 {
        let base = T0 + 60.0 * f64::from(minute);
        r.clock.set(base);
        for vial in 1..=3 {
            // A busy dilution slot is fine; the point is contention.
            let _ = r.manager.handle_command(AppCommand::ForceDilution(vial));
            std::thread::sleep(Duration::from_millis(5));
        }
        r.clock.set(base + 30.0);
        std::thread::sleep(Duration::from_millis(30));
    }
    assert!(r.manager.wait_idle(Duration::from_secs(5)));

    assert!(!r.mock.dispenses().is_empty());
    assert_eq!(r.mock.max_vial_overlap(), 1);
    assert_eq!(r.mock.max_pump_overlap(), 1);
    assert!(!r.manager.lock_status().unwrap().any_held());
}

#[test]
fn rejected_culture_stays_idle() {
    let mock = MockDevice::new();
    mock.set_uncalibrated(2);
    let r = start(mock, vec![turbidostat(1, 0.3), turbidostat(2, 0.3)]);

    assert_eq!(
        r.sink.count(|e| matches!(
            e,
            AppEvent::CultureRejected {
                vial: 2,
                reason: PolicyViolation::MissingCalibration(2)
            }
        )),
        1
    );
    wait_until("first OD", || !r.mock.od_reads().is_empty());
    assert!(r.manager.wait_idle(Duration::from_secs(5)));
    assert!(!r.mock.od_reads().contains(&2));
    assert_eq!(r.mock.last_stirrer(2), None);
}

#[test]
fn stop_drains_and_silences_the_device() {
    let mock = MockDevice::with_latency(Duration::from_millis(5));
    let r = start(mock, vec![turbidostat(1, 0.3), turbidostat(2, 0.3)]);
    wait_until("first OD", || !r.mock.od_reads().is_empty());

    r.manager.stop_experiment().unwrap();
    let calls = r.mock.calls().len();
    r.clock.set(T0 + 3600.0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(r.mock.calls().len(), calls, "device touched after stop");

    assert_eq!(r.mock.last_stirrer(1), Some(StirrerSpeed::Stopped));
    assert_eq!(r.mock.last_stirrer(2), Some(StirrerSpeed::Stopped));
    assert!(persistence::exists(r.store.as_ref(), 1));
    assert!(r.manager.statuses().is_empty());
    assert_eq!(r.manager.stop_experiment(), Err(Error::NoExperiment));
}

#[test]
fn paused_experiment_measures_but_never_dilutes() {
    let mock = MockDevice::new();
    mock.set_od(1, 2.0);
    let r = start(mock, vec![turbidostat(1, 0.3)]);
    r.manager.handle_command(AppCommand::Pause).unwrap();
    assert!(r.manager.is_paused());

    for m in 0..7 {
        r.run_minute(m);
    }
    assert!(r.mock.od_reads().len() >= 7);
    assert!(r.mock.dispenses().is_empty());
    assert_eq!(r.sink.count(|e| matches!(e, AppEvent::Telemetry(_))), 0);

    r.manager.handle_command(AppCommand::Resume).unwrap();
    r.run_minute(7);
    assert!(!r.mock.dispenses().is_empty());
}

#[test]
fn health_and_metrics_while_running() {
    let r = start(MockDevice::new(), vec![turbidostat(1, 0.3)]);
    wait_until("first OD", || !r.mock.od_reads().is_empty());
    assert!(r.manager.wait_idle(Duration::from_secs(5)));

    let health = r.manager.check_status().unwrap();
    assert!(health.is_healthy());
    let metrics = r.manager.metrics().unwrap();
    assert_eq!(metrics.measurement.completed, 1);
    assert_eq!(metrics.failures_total, 0);
}

#[test]
fn job_failures_are_counted_and_logged() {
    let mock = MockDevice::new();
    mock.fail_od(1);
    let r = start(mock, vec![turbidostat(1, 0.3)]);
    wait_until("failed OD", || !r.mock.od_reads().is_empty());
    assert!(r.manager.wait_idle(Duration::from_secs(5)));

    let metrics = r.manager.metrics().unwrap();
    assert_eq!(metrics.measurement.failed, 1);
    assert_eq!(metrics.failures_total, 1);
    assert_eq!(r.manager.recent_failures()[0].job.as_str(), "od-measurement");
    // The engine survives a failed job.
    assert!(r.manager.check_status().is_ok());
}

#[test]
fn state_directory_carries_cultures_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = || ExperimentConfig {
        name: "resume".into(),
        engine: fast_engine(),
        cultures: vec![turbidostat(1, 0.3)],
    };
    let run = |then: &dyn Fn(&ExperimentManager)| {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = ExperimentManager::new(clock, Arc::new(RecordingSink::default()))
            .with_storage(store);
        manager.set_device(Arc::new(MockDevice::new())).unwrap();
        manager.connect_device().unwrap();
        manager.set_current_experiment(config()).unwrap();
        manager.start_experiment().unwrap();
        then(&manager);
        manager.stop_experiment().unwrap();
    };

    run(&|m| {
        m.handle_command(AppCommand::ForceDilution(1)).unwrap();
        assert!(m.wait_idle(Duration::from_secs(5)));
    });
    run(&|m| {
        let status = m.culture_status(1).unwrap();
        assert!((status.generations - (25.0f64 / 15.0).log2()).abs() < 1e-12);
        assert!(status.is_active);
    });
}
