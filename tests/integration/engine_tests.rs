//! Job-level tests: drive the job bodies directly against a [`Device`]
//! built on the mock bioreactor, with no worker threads involved.

use std::sync::Arc;

use replifactory::adapters::time::ManualClock;
use replifactory::app::events::AppEvent;
use replifactory::app::ports::{JobKind, PumpId, StirrerSpeed};
use replifactory::config::{CultureConfig, EngineConfig, PolicyConfig};
use replifactory::culture::Culture;
use replifactory::device::Device;
use replifactory::jobs;

use super::mock_hw::{DeviceCall, MockDevice, RecordingSink, T0, fast_engine, turbidostat};

struct Rig {
    clock: Arc<ManualClock>,
    mock: Arc<MockDevice>,
    sink: Arc<RecordingSink>,
    device: Arc<Device>,
}

fn rig_with(engine: EngineConfig, cultures: &[CultureConfig]) -> Rig {
    let clock = Arc::new(ManualClock::new(T0));
    let mock = Arc::new(MockDevice::new());
    let sink = Arc::new(RecordingSink::default());
    let device = Arc::new(Device::new(mock.clone(), clock.clone(), sink.clone(), engine));
    for config in cultures {
        let mut culture = Culture::new(config);
        culture.activate(T0);
        device.attach(culture);
    }
    Rig {
        clock,
        mock,
        sink,
        device,
    }
}

fn rig(cultures: &[CultureConfig]) -> Rig {
    rig_with(fast_engine(), cultures)
}

#[test]
fn od_read_is_bracketed_by_stirrer_stop_and_restore() {
    let r = rig(&[turbidostat(2, 0.3)]);
    r.mock.set_od(2, 0.12);
    jobs::measure_od(&r.device).unwrap();

    assert_eq!(
        r.mock.calls(),
        vec![
            DeviceCall::Stirrer {
                vial: 2,
                speed: StirrerSpeed::Stopped
            },
            DeviceCall::ReadOd(2),
            DeviceCall::Stirrer {
                vial: 2,
                speed: StirrerSpeed::High
            },
        ]
    );
    let status = r.device.statuses().remove(0);
    assert_eq!(status.od, Some(0.12));
    assert_eq!(status.last_measurement_timestamp, Some(T0));
}

#[test]
fn failed_od_read_skips_vial_but_measures_the_rest() {
    let r = rig(&[turbidostat(1, 0.3), turbidostat(2, 0.3), turbidostat(3, 0.3)]);
    r.mock.fail_od(2);
    assert!(jobs::measure_od(&r.device).is_err());

    assert_eq!(r.mock.od_reads(), vec![1, 2, 3]);
    let statuses = r.device.statuses();
    assert!(statuses[0].od.is_some());
    assert!(statuses[1].od.is_none());
    assert!(statuses[2].od.is_some());
    // The stirrer is restored even after the failed read.
    assert_eq!(r.mock.last_stirrer(2), Some(StirrerSpeed::High));
    assert_eq!(
        r.sink.count(|e| matches!(
            e,
            AppEvent::JobFailed {
                job: JobKind::OdMeasurement
            }
        )),
        1
    );
}

#[test]
fn turbidostat_respects_minimum_delay() {
    let r = rig(&[turbidostat(1, 0.3)]);
    r.mock.set_od(1, 0.4);

    // One minute after activation: above the limit but too soon.
    r.clock.set(T0 + 60.0);
    jobs::measure_od(&r.device).unwrap();
    jobs::update_cultures(&r.device).unwrap();
    assert!(r.mock.dispenses().is_empty());

    // Six minutes: dilute.
    r.clock.set(T0 + 360.0);
    jobs::measure_od(&r.device).unwrap();
    jobs::update_cultures(&r.device).unwrap();
    assert_eq!(r.mock.dispenses(), vec![(1, PumpId::Medium1, 10.0)]);

    let status = r.device.statuses().remove(0);
    assert!((status.generations - (25.0f64 / 15.0).log2()).abs() < 1e-9);
    assert_eq!(
        r.sink
            .count(|e| matches!(e, AppEvent::DilutionPerformed { vial: 1, .. })),
        1
    );
}

#[test]
fn update_emits_telemetry_for_active_cultures_only() {
    let r = rig(&[turbidostat(1, 0.3), turbidostat(2, 0.3)]);
    r.device.with_culture(2, Culture::deactivate);
    jobs::update_cultures(&r.device).unwrap();

    let telemetry: Vec<u8> = r
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            AppEvent::Telemetry(s) => Some(s.vial),
            _ => None,
        })
        .collect();
    assert_eq!(telemetry, vec![1]);
}

#[test]
fn inactive_culture_never_dilutes() {
    let r = rig(&[turbidostat(1, 0.3)]);
    r.mock.set_od(1, 2.0);
    jobs::measure_od(&r.device).unwrap();
    r.device.with_culture(1, Culture::deactivate);

    r.clock.set(T0 + 3600.0);
    jobs::update_cultures(&r.device).unwrap();
    jobs::force_dilution(&r.device, 1).unwrap();
    assert!(r.mock.dispenses().is_empty());
}

#[test]
fn failed_dispense_leaves_culture_unchanged() {
    let r = rig(&[turbidostat(1, 0.3)]);
    r.mock.set_od(1, 0.5);
    r.mock.fail_pump(PumpId::Medium1);
    jobs::measure_od(&r.device).unwrap();

    let before = r.device.snapshots().remove(0);
    r.clock.set(T0 + 600.0);
    assert!(jobs::update_cultures(&r.device).is_err());
    assert_eq!(r.device.snapshots().remove(0), before);
    assert_eq!(
        r.sink
            .count(|e| matches!(e, AppEvent::DilutionFailed { vial: 1 })),
        1
    );

    // Nothing was committed, so there is nothing to flush.
    jobs::flush_tubing(&r.device).unwrap();
    assert!(!r
        .mock
        .dispenses()
        .iter()
        .any(|(_, pump, _)| *pump == PumpId::Waste));

    // The request was released: the next update tries again.
    r.mock.heal();
    r.clock.set(T0 + 660.0);
    jobs::update_cultures(&r.device).unwrap();
    assert!(r.device.statuses()[0].generations > 0.0);
}

#[test]
fn flush_runs_only_after_a_dilution() {
    let r = rig(&[turbidostat(1, 0.3), turbidostat(4, 0.3)]);
    jobs::flush_tubing(&r.device).unwrap();
    assert!(r.mock.dispenses().is_empty());

    r.mock.set_od(1, 0.5);
    jobs::measure_od(&r.device).unwrap();
    r.clock.set(T0 + 600.0);
    jobs::update_cultures(&r.device).unwrap();
    r.mock.clear_calls();

    jobs::flush_tubing(&r.device).unwrap();
    let volume = r.device.config().flush_volume_ml;
    assert_eq!(
        r.mock.dispenses(),
        vec![(1, PumpId::Waste, volume), (4, PumpId::Waste, volume)]
    );

    // Cleared: the next slot is a no-op.
    r.mock.clear_calls();
    jobs::flush_tubing(&r.device).unwrap();
    assert!(r.mock.dispenses().is_empty());
}

#[test]
fn failed_flush_is_retried_next_slot() {
    let r = rig(&[turbidostat(1, 0.3)]);
    r.mock.set_od(1, 0.5);
    jobs::measure_od(&r.device).unwrap();
    r.clock.set(T0 + 600.0);
    jobs::update_cultures(&r.device).unwrap();

    r.mock.fail_pump(PumpId::Waste);
    assert!(jobs::flush_tubing(&r.device).is_err());
    r.mock.heal();
    r.mock.clear_calls();
    jobs::flush_tubing(&r.device).unwrap();
    assert_eq!(r.mock.dispenses().len(), 1);
}

#[test]
fn forced_dilution_keeps_drug_target() {
    let r = rig(&[CultureConfig {
        medium2_stock_concentration: 10.0,
        policy: PolicyConfig::Turbidostat(replifactory::config::TurbidostatParams {
            od_max_limit: 0.3,
            minimum_dilution_delay_minutes: 5.0,
            medium2_concentration: 2.0,
        }),
        ..turbidostat(5, 0.3)
    }]);
    jobs::force_dilution(&r.device, 5).unwrap();

    let dispenses = r.mock.dispenses();
    assert_eq!(dispenses.len(), 2);
    let medium2: f64 = dispenses
        .iter()
        .filter(|(_, p, _)| *p == PumpId::Medium2)
        .map(|(_, _, v)| v)
        .sum();
    // (2·25 − 0·15) / 10 = 5 mL of stock.
    assert!((medium2 - 5.0).abs() < 1e-9);
    assert!((r.device.statuses()[0].drug_concentration - 2.0).abs() < 1e-9);
}

#[test]
fn temperature_is_stored_and_published() {
    let r = rig(&[]);
    jobs::measure_temperature(&r.device).unwrap();
    let reading = r.device.temperature().unwrap();
    assert_eq!(reading.vial_block_c, 37.0);
    assert_eq!(reading.timestamp, T0);
    assert_eq!(
        r.sink.count(|e| matches!(e, AppEvent::Temperature { .. })),
        1
    );
}
