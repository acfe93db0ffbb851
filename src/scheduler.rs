//! Minute-grid job scheduler.
//!
//! A cooperative, second-granularity dispatcher.  Each registered job has
//! a fixed trigger offset within the minute and fires at most once per
//! minute.  The scheduler performs no I/O: when a job falls due it calls
//! the [`SchedulerDelegate`], which enqueues the work onto an operation
//! queue.
//!
//! ```text
//!   second  :57          :00           :30            :31
//!           temperature  OD measurement culture update tubing flush
//!           └── measurement queue ──┘  └──── dilution queue ────┘
//! ```
//!
//! The [`SchedulerRunner`] owns the 1 s tick thread and a cooperative
//! cancel flag checked once per tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use crate::app::ports::{ClockPort, JobKind, SchedulerDelegate};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════
//  Schedule types
// ═══════════════════════════════════════════════════════════════

/// A single schedule entry.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Human-readable label (e.g., "temperature").
    pub label: &'static str,
    pub job: JobKind,
    /// Second within the minute at which the job fires (0-59).
    pub offset_secs: u8,
    pub enabled: bool,
}

/// Maximum number of registered schedules.
const MAX_SCHEDULES: usize = 8;

#[derive(Debug, Clone)]
struct ScheduleEntry {
    schedule: Schedule,
    /// Next wall-clock time the job is due; computed on the first tick.
    next_due: Option<f64>,
}

/// First time `>= now` whose second-of-minute equals `offset`.
fn next_occurrence(now: f64, offset: u8) -> f64 {
    let minute = (now / 60.0).floor() * 60.0;
    let candidate = minute + f64::from(offset);
    if candidate >= now { candidate } else { candidate + 60.0 }
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler engine
// ═══════════════════════════════════════════════════════════════

/// The scheduler engine.
///
/// Decoupled from the queues: firing invokes the [`SchedulerDelegate`]
/// callback, which keeps the scheduler testable with a synthetic clock.
pub struct Scheduler {
    schedules: [Option<ScheduleEntry>; MAX_SCHEDULES],
    ticks: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            schedules: [const { None }; MAX_SCHEDULES],
            ticks: 0,
        }
    }

    /// The engine's job table, with offsets taken from `config`.
    pub fn job_table(config: &EngineConfig) -> [Schedule; 4] {
        let entry = |label, job, offset_secs| Schedule {
            label,
            job,
            offset_secs,
            enabled: true,
        };
        [
            entry("temperature", JobKind::Temperature, config.temperature_offset_secs),
            entry("od-measurement", JobKind::OdMeasurement, config.od_offset_secs),
            entry("culture-update", JobKind::CultureUpdate, config.update_offset_secs),
            entry("tubing-flush", JobKind::TubingFlush, config.flush_offset_secs),
        ]
    }

    /// Drop every job and register the full table afresh.
    pub fn reset(&mut self, config: &EngineConfig) {
        self.schedules = [const { None }; MAX_SCHEDULES];
        for schedule in Self::job_table(config) {
            self.add(schedule);
        }
    }

    /// Add a schedule.  Returns the slot index, or `None` if full.
    pub fn add(&mut self, schedule: Schedule) -> Option<usize> {
        for (i, slot) in self.schedules.iter_mut().enumerate() {
            if slot.is_none() {
                info!(
                    "Scheduler: added '{}' at :{:02} (slot {})",
                    schedule.label, schedule.offset_secs, i
                );
                *slot = Some(ScheduleEntry {
                    schedule,
                    next_due: None,
                });
                return Some(i);
            }
        }
        None
    }

    /// Enable or disable every schedule of one job kind.  A re-enabled
    /// job waits for its next offset rather than catching up.
    pub fn set_job_enabled(&mut self, job: JobKind, enabled: bool) {
        for entry in self.schedules.iter_mut().flatten() {
            if entry.schedule.job == job {
                entry.schedule.enabled = enabled;
                entry.next_due = None;
            }
        }
    }

    /// Evaluate every job at wall-clock time `now` (Unix seconds) and
    /// fire those whose offset has elapsed.
    ///
    /// A job that missed several minutes (clock jump, stalled tick
    /// thread) fires once, not once per missed minute.
    pub fn tick(&mut self, now: f64, delegate: &mut dyn SchedulerDelegate) {
        self.ticks += 1;

        for entry in self.schedules.iter_mut().flatten() {
            if !entry.schedule.enabled {
                continue;
            }
            let offset = entry.schedule.offset_secs;
            let due = *entry.next_due.get_or_insert_with(|| next_occurrence(now, offset));
            if now >= due {
                log::debug!("Scheduler: '{}' due at {:.0}", entry.schedule.label, due);
                delegate.on_job_due(entry.schedule.label, entry.schedule.job);
                // Strictly after `now`, so at most once per minute.
                entry.next_due = Some(next_occurrence(now + 1.0, offset).max(due + 60.0));
            }
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of active (enabled) schedules.
    pub fn active_count(&self) -> usize {
        self.schedules
            .iter()
            .flatten()
            .filter(|e| e.schedule.enabled)
            .count()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tick thread
// ═══════════════════════════════════════════════════════════════

/// Owns the thread that ticks a shared [`Scheduler`].
pub struct SchedulerRunner {
    cancel: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerRunner {
    pub fn spawn(
        scheduler: Arc<Mutex<Scheduler>>,
        mut delegate: Box<dyn SchedulerDelegate + Send>,
        clock: Arc<dyn ClockPort>,
        tick_interval: Duration,
    ) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let thread_cancel = Arc::clone(&cancel);
        let thread_ticks = Arc::clone(&ticks);

        let handle = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                info!("Scheduler: tick loop started ({} ms)", tick_interval.as_millis());
                while !thread_cancel.load(Ordering::Acquire) {
                    let now = clock.now();
                    {
                        let mut sched = scheduler.lock().unwrap_or_else(|p| p.into_inner());
                        sched.tick(now, delegate.as_mut());
                        thread_ticks.store(sched.ticks(), Ordering::Relaxed);
                    }
                    std::thread::sleep(tick_interval);
                }
                info!("Scheduler: tick loop stopped");
            })
            .map_err(|_| Error::ThreadSpawn("scheduler"))?;

        Ok(Self {
            cancel,
            ticks,
            handle: Some(handle),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Set the cancel flag and wait for the loop to exit (at most one
    /// tick interval).
    pub fn halt(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Scheduler: tick thread terminated abnormally");
            }
        }
    }
}

impl Drop for SchedulerRunner {
    fn drop(&mut self) {
        self.halt();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
