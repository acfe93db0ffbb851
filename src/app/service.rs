//! Experiment lifecycle manager: the hexagonal core.
//!
//! [`ExperimentManager`] is the single authoritative holder of the current
//! device connection and the running experiment.  It is constructed
//! explicitly and passed around; there is no global instance.  Two coarse
//! locks keep lifecycle operations from interleaving:
//!
//! - the **device-swap lock** guards the device port (`set_device`,
//!   `connect_device`, `disconnect_device`);
//! - the **experiment-swap lock** guards the running experiment
//!   (`set_current_experiment`, `start_experiment`, `stop_experiment`).
//!
//! When both are needed the experiment lock is taken first.
//!
//! ```text
//!  DevicePort ──▶ ┌──────────────────────────────┐ ──▶ EventSink
//!                 │      ExperimentManager        │
//!  ClockPort  ──▶ │ Scheduler · Workers · Device  │ ◀─▶ StoragePort
//!                 └──────────────────────────────┘
//! ```
//!
//! Stopping halts the scheduler, drains both workers and only then
//! releases the device, so no queued operation can fire against a device
//! that is no longer ours.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::ExperimentConfig;
use crate::culture::Culture;
use crate::culture::policy::PolicyKind;
use crate::device::{Device, JobDispatcher, TemperatureReading};
use crate::diagnostics::{EngineHealth, FailureEntry, FailureLog, RuntimeMetrics};
use crate::error::{Error, PolicyViolation, Result};
use crate::locks::LockStatus;
use crate::persistence;
use crate::queue::Worker;
use crate::scheduler::{Scheduler, SchedulerRunner};

use super::commands::AppCommand;
use super::events::{AppEvent, CultureStatus};
use super::ports::{ClockPort, DevicePort, EventSink, JobKind, StirrerSpeed, StoragePort};

/// Outcome of [`ExperimentManager::start_experiment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Vials whose culture passed its check and is now active.
    pub active: Vec<u8>,
    /// Vials whose culture failed its check, with the reason.
    pub rejected: Vec<(u8, PolicyViolation)>,
}

/// A running experiment and the threads serving it.
struct RunningExperiment {
    name: String,
    device: Arc<Device>,
    scheduler: Arc<Mutex<Scheduler>>,
    runner: SchedulerRunner,
    measurement: Worker,
    dilution: Worker,
    started_at: f64,
    paused: bool,
}

// ───────────────────────────────────────────────────────────────
// ExperimentManager
// ───────────────────────────────────────────────────────────────

pub struct ExperimentManager {
    clock: Arc<dyn ClockPort>,
    events: Arc<dyn EventSink>,
    storage: Option<Arc<dyn StoragePort>>,
    /// Device-swap lock.
    device: Mutex<Option<Arc<dyn DevicePort>>>,
    /// Experiment-swap lock.
    experiment: Mutex<ExperimentSlot>,
}

#[derive(Default)]
struct ExperimentSlot {
    config: Option<ExperimentConfig>,
    running: Option<RunningExperiment>,
}

impl ExperimentManager {
    pub fn new(clock: Arc<dyn ClockPort>, events: Arc<dyn EventSink>) -> Self {
        Self {
            clock,
            events,
            storage: None,
            device: Mutex::new(None),
            experiment: Mutex::new(ExperimentSlot::default()),
        }
    }

    /// Persist culture snapshots through `storage` on stop and on
    /// [`AppCommand::SaveSnapshots`], and restore them on start.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StoragePort>) -> Self {
        self.storage = Some(storage);
        self
    }

    // ── Device ────────────────────────────────────────────────

    /// Install the device port.  Refused while an experiment runs.
    pub fn set_device(&self, port: Arc<dyn DevicePort>) -> Result<()> {
        let slot = self.experiment();
        if slot.running.is_some() {
            return Err(Error::ExperimentRunning);
        }
        *self.device_port() = Some(port);
        Ok(())
    }

    /// One blocking connection attempt.  Failure is reported, never
    /// retried here.
    pub fn connect_device(&self) -> Result<()> {
        let guard = self.device_port();
        let port = guard.as_ref().ok_or(Error::NoDevice)?;
        match port.connect() {
            Ok(()) => {
                info!("Manager: device connected");
                Ok(())
            }
            Err(e) => {
                warn!("Manager: connect failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Stop any running experiment, then close the connection.
    pub fn disconnect_device(&self) -> Result<()> {
        let mut slot = self.experiment();
        if let Some(running) = slot.running.take() {
            self.shutdown(running);
        }
        let guard = self.device_port();
        let port = guard.as_ref().ok_or(Error::NoDevice)?;
        port.disconnect();
        info!("Manager: device disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.device_port().as_ref().is_some_and(|p| p.is_connected())
    }

    // ── Experiment lifecycle ──────────────────────────────────

    /// Select the experiment the next start will run.
    pub fn set_current_experiment(&self, config: ExperimentConfig) -> Result<()> {
        config.validate()?;
        let mut slot = self.experiment();
        if slot.running.is_some() {
            return Err(Error::ExperimentRunning);
        }
        info!(
            "Manager: experiment '{}' selected ({} cultures)",
            config.name,
            config.cultures.len()
        );
        slot.config = Some(config);
        Ok(())
    }

    /// Check and activate every culture, then start the scheduler and
    /// both workers.  Cultures failing their check stay inactive and are
    /// listed in the report; they do not prevent the others from running.
    pub fn start_experiment(&self) -> Result<StartReport> {
        let mut slot = self.experiment();
        if slot.running.is_some() {
            return Err(Error::ExperimentRunning);
        }
        let config = slot.config.clone().ok_or(Error::NoExperiment)?;
        let port = self.device_port().clone().ok_or(Error::NoDevice)?;
        if !port.is_connected() {
            return Err(Error::NoDevice);
        }

        let engine = config.engine.clone();
        let device = Arc::new(Device::new(
            Arc::clone(&port),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
            engine.clone(),
        ));
        if let Some(storage) = self.storage.as_ref() {
            device
                .failures()
                .preload(FailureLog::load_persisted(storage.as_ref()));
        }

        let now = self.clock.now();
        let mut report = StartReport {
            active: Vec::new(),
            rejected: Vec::new(),
        };
        for culture_config in &config.cultures {
            let fresh = Culture::new(culture_config);
            let mut culture = self
                .restore(culture_config.vial, fresh.kind())
                .unwrap_or(fresh)
                .with_growth_window_minutes(engine.growth_window_minutes);
            let vial = culture.vial();
            match culture.check(port.as_ref(), engine.max_vial_volume_ml) {
                Ok(()) => {
                    culture.activate(now);
                    report.active.push(vial);
                    info!("Manager: vial {} active ({})", vial, culture.describe());
                }
                Err(reason) => {
                    warn!("Manager: vial {vial} rejected: {reason}");
                    self.events
                        .emit(&AppEvent::CultureRejected { vial, reason });
                    report.rejected.push((vial, reason));
                }
            }
            device.attach(culture);
        }

        for &vial in &report.active {
            if let Err(e) = port.set_stirrer_speed(vial, engine.stirrer_speed) {
                warn!("Manager: vial {vial} stirrer start failed: {e}");
            }
        }

        let scheduler = Arc::new(Mutex::new(Scheduler::new()));
        scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset(&engine);

        let poll = Duration::from_millis(engine.worker_poll_interval_ms);
        let measurement = Worker::spawn(
            Arc::clone(device.measurement_queue()),
            poll,
            Arc::clone(&self.clock),
            Arc::clone(device.failures()),
        )?;
        let dilution = Worker::spawn(
            Arc::clone(device.dilution_queue()),
            poll,
            Arc::clone(&self.clock),
            Arc::clone(device.failures()),
        )?;
        let runner = SchedulerRunner::spawn(
            Arc::clone(&scheduler),
            Box::new(JobDispatcher::new(Arc::clone(&device))),
            Arc::clone(&self.clock),
            Duration::from_millis(engine.tick_interval_ms),
        )?;

        info!(
            "Manager: experiment '{}' started, {} active / {} rejected",
            config.name,
            report.active.len(),
            report.rejected.len()
        );
        self.events.emit(&AppEvent::ExperimentStarted {
            name: config.name.clone(),
            active_cultures: report.active.len(),
        });
        slot.running = Some(RunningExperiment {
            name: config.name,
            device,
            scheduler,
            runner,
            measurement,
            dilution,
            started_at: now,
            paused: false,
        });
        Ok(report)
    }

    /// Halt the scheduler, drain both workers, stop the stirrers and
    /// deactivate every culture.  Blocks until an in-flight operation
    /// has finished.
    pub fn stop_experiment(&self) -> Result<()> {
        let mut slot = self.experiment();
        let running = slot.running.take().ok_or(Error::NoExperiment)?;
        self.shutdown(running);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.experiment().running.is_some()
    }

    // ── Command handling ──────────────────────────────────────

    pub fn handle_command(&self, cmd: AppCommand) -> Result<()> {
        let mut slot = self.experiment();
        let running = slot.running.as_mut().ok_or(Error::NoExperiment)?;
        match cmd {
            AppCommand::Pause => {
                Self::set_updates_enabled(running, false);
                running.paused = true;
                info!("Manager: paused (measuring only)");
            }
            AppCommand::Resume => {
                Self::set_updates_enabled(running, true);
                running.paused = false;
                info!("Manager: resumed");
            }
            AppCommand::ForceDilution(vial) => {
                running.device.enqueue_forced_dilution(vial)?;
                info!("Manager: forced dilution of vial {vial} queued");
            }
            AppCommand::Deactivate(vial) => {
                running
                    .device
                    .with_culture(vial, Culture::deactivate)
                    .ok_or(Error::PolicyViolation(PolicyViolation::VialOutOfRange(vial)))?;
                info!("Manager: vial {vial} deactivated");
            }
            AppCommand::SaveSnapshots => {
                self.save_snapshots(&running.device)?;
            }
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────

    /// Status of every attached culture, by vial.
    pub fn statuses(&self) -> Vec<CultureStatus> {
        self.with_running(|r| r.device.statuses())
            .unwrap_or_default()
    }

    pub fn culture_status(&self, vial: u8) -> Option<CultureStatus> {
        self.statuses().into_iter().find(|s| s.vial == vial)
    }

    /// Which vial and pump locks are currently held.
    pub fn lock_status(&self) -> Option<LockStatus> {
        self.with_running(|r| r.device.lock_status())
    }

    pub fn temperature(&self) -> Option<TemperatureReading> {
        self.with_running(|r| r.device.temperature()).flatten()
    }

    pub fn is_paused(&self) -> bool {
        self.with_running(|r| r.paused).unwrap_or(false)
    }

    /// Liveness of the scheduler and both workers; `None` when idle.
    pub fn health(&self) -> Option<EngineHealth> {
        self.with_running(|r| EngineHealth {
            scheduler_alive: r.runner.is_alive(),
            measurement_worker_alive: r.measurement.is_alive(),
            dilution_worker_alive: r.dilution.is_alive(),
        })
    }

    /// `Ok` while every engine thread is alive.  A dead thread is fatal
    /// and needs an operator; it is never restarted here.
    pub fn check_status(&self) -> Result<EngineHealth> {
        let health = self.health().ok_or(Error::NoExperiment)?;
        if !health.is_healthy() {
            error!("Manager: engine thread died: {health:?}");
            return Err(Error::EngineHalted);
        }
        Ok(health)
    }

    pub fn metrics(&self) -> Option<RuntimeMetrics> {
        let now = self.clock.now();
        self.with_running(|r| RuntimeMetrics {
            uptime_secs: now - r.started_at,
            scheduler_ticks: r.runner.ticks(),
            measurement: r.device.measurement_queue().stats(),
            dilution: r.device.dilution_queue().stats(),
            failures_total: r.device.failures().total(),
            recent_failures: r.device.failures().entries(),
        })
    }

    pub fn recent_failures(&self) -> Vec<FailureEntry> {
        self.with_running(|r| r.device.failures().entries())
            .unwrap_or_default()
    }

    /// Block until both queues are idle or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self
                .with_running(|r| {
                    r.device.measurement_queue().is_idle() && r.device.dilution_queue().is_idle()
                })
                .unwrap_or(true);
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    // ── Internal ──────────────────────────────────────────────

    fn experiment(&self) -> MutexGuard<'_, ExperimentSlot> {
        self.experiment.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn device_port(&self) -> MutexGuard<'_, Option<Arc<dyn DevicePort>>> {
        self.device.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_running<R>(&self, f: impl FnOnce(&RunningExperiment) -> R) -> Option<R> {
        self.experiment().running.as_ref().map(f)
    }

    fn set_updates_enabled(running: &RunningExperiment, enabled: bool) {
        running
            .scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .set_job_enabled(JobKind::CultureUpdate, enabled);
    }

    /// Try to restore a persisted culture of the same policy.
    fn restore(&self, vial: u8, kind: PolicyKind) -> Option<Culture> {
        let storage = self.storage.as_ref()?;
        match persistence::load(storage.as_ref(), vial, kind) {
            Ok(Some(culture)) => {
                info!("Manager: vial {vial} restored from snapshot");
                Some(culture)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Manager: vial {vial} snapshot discarded: {e}");
                if let Err(e) = persistence::delete(storage.as_ref(), vial) {
                    warn!("Manager: vial {vial} stale snapshot not removed: {e}");
                }
                None
            }
        }
    }

    fn save_snapshots(&self, device: &Device) -> Result<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };
        for snapshot in device.snapshots() {
            persistence::save(storage.as_ref(), &snapshot)?;
        }
        if let Err(e) = device.failures().persist(storage.as_ref()) {
            warn!("Manager: failure log not persisted: {e}");
        }
        info!("Manager: snapshots saved");
        Ok(())
    }

    fn shutdown(&self, mut running: RunningExperiment) {
        info!("Manager: stopping experiment '{}'", running.name);
        running.runner.halt();
        running.measurement.shutdown();
        running.dilution.shutdown();

        let port = running.device.port();
        for vial in running.device.active_vials() {
            if let Err(e) = port.set_stirrer_speed(vial, StirrerSpeed::Stopped) {
                warn!("Manager: vial {vial} stirrer stop failed: {e}");
            }
        }
        running.device.deactivate_all();
        if let Err(e) = self.save_snapshots(&running.device) {
            warn!("Manager: snapshots not saved: {e}");
        }
        self.events.emit(&AppEvent::ExperimentStopped {
            name: running.name.clone(),
        });
        info!("Manager: experiment '{}' stopped", running.name);
    }
}

impl Drop for ExperimentManager {
    fn drop(&mut self) {
        let running = self.experiment().running.take();
        if let Some(running) = running {
            self.shutdown(running);
        }
    }
}
