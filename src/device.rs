//! The authoritative runtime state of one machine.
//!
//! [`Device`] owns the vial → [`Culture`] map, the resource locks, the two
//! operation queues and the latest temperature reading.  It is built by
//! the [`ExperimentManager`](crate::app::service::ExperimentManager) when
//! an experiment starts and shared (`Arc<Device>`) with the scheduler
//! delegate and every queued job; there is no global instance.
//!
//! The culture map mutex is only held for in-memory work, never across a
//! device call.  Device calls happen under the resource locks instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::app::events::{AppEvent, CultureStatus};
use crate::app::ports::{ClockPort, DevicePort, EventSink, JobKind, SchedulerDelegate};
use crate::config::EngineConfig;
use crate::culture::{Culture, CultureSnapshot};
use crate::diagnostics::FailureLog;
use crate::error::{Error, Result};
use crate::jobs;
use crate::locks::{LockStatus, ResourceLocks};
use crate::queue::{Operation, OperationQueue};

/// Latest temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub timestamp: f64,
    pub vial_block_c: f64,
    pub board_c: f64,
}

pub struct Device {
    port: Arc<dyn DevicePort>,
    clock: Arc<dyn ClockPort>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,

    cultures: Mutex<BTreeMap<u8, Culture>>,
    locks: ResourceLocks,
    measurement: Arc<OperationQueue>,
    dilution: Arc<OperationQueue>,

    temperature: Mutex<Option<TemperatureReading>>,
    /// Set by a committed dilution, cleared by the tubing flush.
    flush_needed: AtomicBool,
    failures: Arc<FailureLog>,
}

impl Device {
    pub fn new(
        port: Arc<dyn DevicePort>,
        clock: Arc<dyn ClockPort>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        let lock_timeout = Duration::from_millis(config.lock_timeout_ms);
        Self {
            port,
            clock,
            events,
            config,
            cultures: Mutex::new(BTreeMap::new()),
            locks: ResourceLocks::new(lock_timeout),
            measurement: Arc::new(OperationQueue::new("measurement")),
            dilution: Arc::new(OperationQueue::new("dilution")),
            temperature: Mutex::new(None),
            flush_needed: AtomicBool::new(false),
            failures: Arc::new(FailureLog::new()),
        }
    }

    // ── Collaborators ─────────────────────────────────────────

    pub fn port(&self) -> &dyn DevicePort {
        self.port.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn ClockPort> {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn emit(&self, event: AppEvent) {
        self.events.emit(&event);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn failures(&self) -> &Arc<FailureLog> {
        &self.failures
    }

    pub fn measurement_queue(&self) -> &Arc<OperationQueue> {
        &self.measurement
    }

    pub fn dilution_queue(&self) -> &Arc<OperationQueue> {
        &self.dilution
    }

    // ── Cultures ──────────────────────────────────────────────

    /// Attach a culture, replacing any culture already on its vial.
    pub fn attach(&self, culture: Culture) {
        self.cultures().insert(culture.vial(), culture);
    }

    /// Run `f` on one culture under the map lock.  `f` must not do I/O.
    pub fn with_culture<R>(&self, vial: u8, f: impl FnOnce(&mut Culture) -> R) -> Option<R> {
        self.cultures().get_mut(&vial).map(f)
    }

    /// Vials whose culture is active, ascending.
    pub fn active_vials(&self) -> Vec<u8> {
        self.cultures()
            .values()
            .filter(|c| c.is_active())
            .map(Culture::vial)
            .collect()
    }

    pub fn statuses(&self) -> Vec<CultureStatus> {
        self.cultures().values().map(Culture::status).collect()
    }

    pub fn snapshots(&self) -> Vec<CultureSnapshot> {
        self.cultures().values().map(Culture::snapshot).collect()
    }

    pub fn deactivate_all(&self) {
        for culture in self.cultures().values_mut() {
            culture.deactivate();
        }
    }

    fn cultures(&self) -> MutexGuard<'_, BTreeMap<u8, Culture>> {
        self.cultures.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Measurements and flags ────────────────────────────────

    pub fn temperature(&self) -> Option<TemperatureReading> {
        *self.temperature.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn store_temperature(&self, reading: TemperatureReading) {
        *self.temperature.lock().unwrap_or_else(|p| p.into_inner()) = Some(reading);
    }

    pub(crate) fn mark_flush_needed(&self) {
        self.flush_needed.store(true, Ordering::Release);
    }

    /// Claim the pending flush, if any.
    pub(crate) fn take_flush_needed(&self) -> bool {
        self.flush_needed.swap(false, Ordering::AcqRel)
    }

    pub fn lock_status(&self) -> LockStatus {
        self.locks.status()
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Enqueue a scheduled job onto the queue that owns its resource
    /// class.  A full slot drops the job and reports it.
    pub fn enqueue_job(self: &Arc<Self>, label: &'static str, job: JobKind) -> Result<()> {
        let device = Arc::clone(self);
        let op: Operation = match job {
            JobKind::Temperature => Box::new(move || jobs::measure_temperature(&device)),
            JobKind::OdMeasurement => Box::new(move || jobs::measure_od(&device)),
            JobKind::CultureUpdate => Box::new(move || jobs::update_cultures(&device)),
            JobKind::TubingFlush => Box::new(move || jobs::flush_tubing(&device)),
        };
        let queue = match job {
            JobKind::Temperature | JobKind::OdMeasurement => &self.measurement,
            JobKind::CultureUpdate | JobKind::TubingFlush => &self.dilution,
        };
        queue.enqueue(label, op).inspect_err(|e| {
            if *e == Error::QueueSaturated {
                self.emit(AppEvent::JobDropped { job });
            }
        })
    }

    /// Enqueue an operator-forced dilution of one vial.
    pub fn enqueue_forced_dilution(self: &Arc<Self>, vial: u8) -> Result<()> {
        let device = Arc::clone(self);
        self.dilution
            .enqueue("forced-dilution", Box::new(move || jobs::force_dilution(&device, vial)))
    }
}

/// Scheduler delegate that turns due jobs into queued operations.
pub struct JobDispatcher {
    device: Arc<Device>,
}

impl JobDispatcher {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl SchedulerDelegate for JobDispatcher {
    fn on_job_due(&mut self, label: &'static str, job: JobKind) {
        // QueueSaturated is backpressure; the job simply retries next minute.
        let _ = self.device.enqueue_job(label, job);
    }
}
