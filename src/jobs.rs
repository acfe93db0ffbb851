//! Bodies of the scheduled jobs.
//!
//! Each job runs on a worker thread, one at a time per queue.  Device
//! calls are made under the resource locks; the culture map is touched
//! only between calls.  A per-vial failure is logged and the job moves on
//! to the next vial; the last error is returned so the worker records the
//! job as failed.
//!
//! | Job              | Queue       | Locks                 |
//! |------------------|-------------|-----------------------|
//! | temperature      | measurement | none                  |
//! | od-measurement   | measurement | vial                  |
//! | culture-update   | dilution    | vial, then pumps      |
//! | tubing-flush     | dilution    | vial, then pumps      |
//! | forced-dilution  | dilution    | vial, then pumps      |

use std::time::Duration;

use crate::app::events::AppEvent;
use crate::app::ports::{JobKind, PumpId, StirrerSpeed};
use crate::culture::dilution::{self, DilutionRequest};
use crate::device::{Device, TemperatureReading};
use crate::error::{Error, Result};

pub fn measure_temperature(device: &Device) -> Result<()> {
    let (vial_block_c, board_c) = device.port().read_temperature().inspect_err(|_| {
        device.emit(AppEvent::JobFailed {
            job: JobKind::Temperature,
        });
    })?;
    device.store_temperature(TemperatureReading {
        timestamp: device.now(),
        vial_block_c,
        board_c,
    });
    device.emit(AppEvent::Temperature {
        vial_block_c,
        board_c,
    });
    Ok(())
}

/// Read OD of every active vial, one vial at a time.
pub fn measure_od(device: &Device) -> Result<()> {
    let mut last_err = None;
    for vial in device.active_vials() {
        if let Err(e) = measure_vial(device, vial) {
            log::warn!("Measurement: vial {vial}: {e}");
            last_err = Some(e);
        }
    }
    finish(device, JobKind::OdMeasurement, last_err)
}

/// Stop the stirrer, let the liquid settle, read, restore the stirrer.
fn measure_vial(device: &Device, vial: u8) -> Result<()> {
    let _vial = device.locks().vial(vial)?;
    let port = device.port();
    let config = device.config();

    port.set_stirrer_speed(vial, StirrerSpeed::Stopped)?;
    if config.stirrer_settle_ms > 0 {
        std::thread::sleep(Duration::from_millis(config.stirrer_settle_ms));
    }
    let reading = port.read_od(vial);
    // Restore even when the read failed.
    let restored = port.set_stirrer_speed(vial, config.stirrer_speed);

    let od = reading?;
    let now = device.now();
    device.with_culture(vial, |c| c.record_od(now, od));
    restored?;
    Ok(())
}

/// Run `update()` on every active culture in vial order and perform the
/// dilutions it requests, then publish telemetry.
pub fn update_cultures(device: &Device) -> Result<()> {
    let now = device.now();
    let mut last_err = None;
    for vial in device.active_vials() {
        let request = device.with_culture(vial, |c| c.update(now)).flatten();
        if let Some(request) = request {
            if let Err(e) = perform_dilution(device, &request) {
                last_err = Some(e);
            }
        }
    }
    for status in device.statuses().into_iter().filter(|s| s.is_active) {
        device.emit(AppEvent::Telemetry(status));
    }
    finish(device, JobKind::CultureUpdate, last_err)
}

/// Operator override: dilute one vial now.
pub fn force_dilution(device: &Device, vial: u8) -> Result<()> {
    let now = device.now();
    match device.with_culture(vial, |c| c.force_dilution(now)).flatten() {
        Some(request) => perform_dilution(device, &request),
        None => {
            log::info!("Dilution: vial {vial} has nothing to dilute (inactive, batch or pending)");
            Ok(())
        }
    }
}

/// Execute a planned dilution under the vial and pump locks, then commit
/// it on success or release it on failure.
pub fn perform_dilution(device: &Device, request: &DilutionRequest) -> Result<()> {
    let vial = request.vial;
    let outcome = match device.locks().dispense(vial) {
        Ok(_guard) => dilution::dispense(device.port(), request).map_err(Error::from),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            device.with_culture(vial, |c| c.commit_dilution(request));
            device.mark_flush_needed();
            log::info!(
                "Dilution: vial {} +{:.2} mL medium1 +{:.2} mL medium2 -> {:.3}",
                vial,
                request.medium1_ml,
                request.medium2_ml,
                request.resulting_concentration
            );
            device.emit(AppEvent::DilutionPerformed {
                vial,
                medium1_ml: request.medium1_ml,
                medium2_ml: request.medium2_ml,
                concentration: request.resulting_concentration,
                generations: request.generations,
            });
            Ok(())
        }
        Err(e) => {
            device.with_culture(vial, |c| c.abort_dilution());
            log::warn!("Dilution: vial {vial} abandoned: {e}");
            device.emit(AppEvent::DilutionFailed { vial });
            Err(e)
        }
    }
}

/// Run the waste pump on every active vial if anything was diluted since
/// the previous flush.
pub fn flush_tubing(device: &Device) -> Result<()> {
    if !device.take_flush_needed() {
        log::debug!("Flush: nothing diluted since last flush");
        return Ok(());
    }
    let volume = device.config().flush_volume_ml;
    let mut last_err = None;
    for vial in device.active_vials() {
        let result = match device.locks().dispense(vial) {
            Ok(_guard) => device
                .port()
                .dispense(vial, PumpId::Waste, volume)
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Flush: vial {vial}: {e}");
            last_err = Some(e);
        }
    }
    if last_err.is_some() {
        // Retry at the next flush slot.
        device.mark_flush_needed();
    }
    finish(device, JobKind::TubingFlush, last_err)
}

fn finish(device: &Device, job: JobKind, last_err: Option<Error>) -> Result<()> {
    match last_err {
        Some(e) => {
            device.emit(AppEvent::JobFailed { job });
            Err(e)
        }
        None => Ok(()),
    }
}
