//! Scheduler → dispatcher → queue tests with a synthetic clock.
//!
//! The scheduler is ticked by hand once per simulated second, so every
//! firing and every queue decision is deterministic.

use std::sync::Arc;
use std::time::Duration;

use replifactory::adapters::time::ManualClock;
use replifactory::app::events::AppEvent;
use replifactory::app::ports::{ClockPort, JobKind};
use replifactory::culture::Culture;
use replifactory::device::{Device, JobDispatcher};
use replifactory::queue::Worker;
use replifactory::scheduler::Scheduler;

use super::mock_hw::{DeviceCall, MockDevice, RecordingSink, T0, fast_engine, turbidostat};

struct Rig {
    clock: Arc<ManualClock>,
    mock: Arc<MockDevice>,
    sink: Arc<RecordingSink>,
    device: Arc<Device>,
    scheduler: Scheduler,
    dispatcher: JobDispatcher,
}

fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new(T0));
    let mock = Arc::new(MockDevice::new());
    let sink = Arc::new(RecordingSink::default());
    let engine = fast_engine();
    let device = Arc::new(Device::new(
        mock.clone(),
        clock.clone(),
        sink.clone(),
        engine.clone(),
    ));
    let mut culture = Culture::new(&turbidostat(1, 0.3));
    culture.activate(T0);
    device.attach(culture);

    let mut scheduler = Scheduler::new();
    scheduler.reset(&engine);
    let dispatcher = JobDispatcher::new(Arc::clone(&device));
    Rig {
        clock,
        mock,
        sink,
        device,
        scheduler,
        dispatcher,
    }
}

impl Rig {
    fn tick_at(&mut self, t: f64) {
        self.clock.set(t);
        self.scheduler.tick(self.clock.now(), &mut self.dispatcher);
    }

    fn dropped(&self, job: JobKind) -> usize {
        self.sink
            .count(|e| matches!(e, AppEvent::JobDropped { job: j } if *j == job))
    }
}

#[test]
fn occupied_slot_drops_the_later_job() {
    let mut r = rig();
    for s in 0..60 {
        r.tick_at(T0 + f64::from(s));
    }
    // No workers: OD holds the measurement slot, the update holds the
    // dilution slot.
    assert!(r.device.measurement_queue().has_pending());
    assert!(r.device.dilution_queue().has_pending());
    assert_eq!(r.dropped(JobKind::Temperature), 1);
    assert_eq!(r.dropped(JobKind::TubingFlush), 1);
    assert_eq!(r.dropped(JobKind::OdMeasurement), 0);
    assert_eq!(r.device.measurement_queue().stats().dropped, 1);
    assert!(r.mock.calls().is_empty());
}

#[test]
fn temperature_lands_before_next_minute_measurement() {
    let mut r = rig();
    let measurement = Worker::spawn(
        Arc::clone(r.device.measurement_queue()),
        Duration::from_millis(1),
        r.clock.clone(),
        Arc::clone(r.device.failures()),
    )
    .unwrap();
    let dilution = Worker::spawn(
        Arc::clone(r.device.dilution_queue()),
        Duration::from_millis(1),
        r.clock.clone(),
        Arc::clone(r.device.failures()),
    )
    .unwrap();
    let step = |r: &mut Rig, s: u32| {
        r.tick_at(T0 + f64::from(s));
        assert!(measurement.wait_idle(Duration::from_secs(5)));
        assert!(dilution.wait_idle(Duration::from_secs(5)));
    };

    // :40 through :59, then :00 of the next minute.
    for s in 40..60 {
        step(&mut r, s);
    }
    let stored = r.device.temperature().expect("temperature stored at :57");
    assert_eq!(stored.timestamp, T0 + 57.0);
    assert!(!r.mock.calls().contains(&DeviceCall::ReadOd(1)));

    for s in 60..=100 {
        step(&mut r, s);
    }
    let calls = r.mock.calls();
    let temp = calls.iter().position(|c| *c == DeviceCall::ReadTemperature);
    let od = calls.iter().position(|c| *c == DeviceCall::ReadOd(1));
    assert!(temp.unwrap() < od.unwrap());

    // The :30 update sees the reading taken at :00 of the same minute.
    let telemetry: Vec<_> = r
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            AppEvent::Telemetry(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(telemetry.len(), 1, "one culture update per minute");
    assert_eq!(telemetry[0].last_measurement_timestamp, Some(T0 + 60.0));
    assert_eq!(r.dropped(JobKind::Temperature), 0);
    assert_eq!(r.dropped(JobKind::OdMeasurement), 0);
    assert_eq!(r.device.measurement_queue().stats().completed, 2);
}

#[test]
fn paused_updates_keep_measuring() {
    let mut r = rig();
    r.scheduler.set_job_enabled(JobKind::CultureUpdate, false);
    for s in 0..60 {
        r.tick_at(T0 + f64::from(s));
    }
    assert!(r.device.measurement_queue().has_pending());
    // The flush found the dilution slot free.
    assert_eq!(r.dropped(JobKind::TubingFlush), 0);
}

#[test]
fn clock_jump_fires_each_job_once() {
    let mut r = rig();
    r.tick_at(T0 + 1.0);
    r.device.measurement_queue().discard_pending();
    r.device.dilution_queue().discard_pending();

    // Ten minutes lost: every job is due once.  Temperature takes the
    // measurement slot first, the update takes the dilution slot.
    r.tick_at(T0 + 601.0);
    assert_eq!(r.dropped(JobKind::Temperature), 0);
    assert_eq!(r.dropped(JobKind::OdMeasurement), 1);
    assert_eq!(r.dropped(JobKind::TubingFlush), 1);

    // No catch-up for the missed minutes.
    for s in 602..620 {
        r.tick_at(T0 + f64::from(s));
    }
    assert_eq!(r.dropped(JobKind::OdMeasurement), 1);
    assert_eq!(r.dropped(JobKind::TubingFlush), 1);
}
