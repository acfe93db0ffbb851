//! Single-slot operation queues and their worker threads.
//!
//! Each queue holds at most one pending operation.  `enqueue` never
//! blocks: when the slot is occupied the new operation is dropped and the
//! caller gets [`Error::QueueSaturated`].  A dedicated worker thread
//! drains the slot, runs one operation at a time, and survives every
//! failure the operation reports (including a panic).
//!
//! ```text
//!   Scheduler ──enqueue──▶ [ slot ] ──dequeue──▶ Worker ──▶ op()
//!                  │                                │
//!                  └─ QueueSaturated                └─ Err / panic logged,
//!                                                      loop continues
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use heapless::spsc::Queue;

use crate::app::ports::ClockPort;
use crate::diagnostics::{FailureEntry, FailureLog, WorkerCounters, WorkerStats, panic_reason};
use crate::error::{Error, Result};

/// A queued unit of hardware work.
pub type Operation = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Pending {
    label: &'static str,
    op: Operation,
}

/// A queue with room for exactly one pending operation.
///
/// `spsc::Queue<_, 2>` holds `N - 1 = 1` element.
pub struct OperationQueue {
    name: &'static str,
    slot: Mutex<Queue<Pending, 2>>,
    performing: AtomicBool,
    counters: WorkerCounters,
}

impl OperationQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Queue::new()),
            performing: AtomicBool::new(false),
            counters: WorkerCounters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Offer an operation.  Never blocks.
    pub fn enqueue(&self, label: &'static str, op: Operation) -> Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.enqueue(Pending { label, op }) {
            Ok(()) => Ok(()),
            Err(_rejected) => {
                drop(slot);
                self.counters.dropped();
                log::info!("Worker[{}]: slot occupied, '{}' not queued", self.name, label);
                Err(Error::QueueSaturated)
            }
        }
    }

    /// Whether an operation is waiting in the slot.
    pub fn has_pending(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        !slot.is_empty()
    }

    /// Whether the worker is executing an operation right now.
    pub fn is_performing_operation(&self) -> bool {
        self.performing.load(Ordering::Acquire)
    }

    /// Nothing pending and nothing running.
    pub fn is_idle(&self) -> bool {
        !self.has_pending() && !self.is_performing_operation()
    }

    /// Discard the pending operation, if any.  Returns whether one was
    /// discarded.
    pub fn discard_pending(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.dequeue() {
            Some(p) => {
                log::info!("Worker[{}]: discarding pending '{}'", self.name, p.label);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Take the pending operation and mark the queue busy in one step so
    /// `is_idle` never observes a gap between the two.
    fn take(&self) -> Option<Pending> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        let pending = slot.dequeue()?;
        self.performing.store(true, Ordering::Release);
        Some(pending)
    }

    fn finish(&self) {
        self.performing.store(false, Ordering::Release);
    }

    /// Run one operation at the worker boundary: every failure is logged
    /// and recorded, none escapes.
    fn run(&self, pending: Pending, clock: &dyn ClockPort, failures: &FailureLog) {
        let Pending { label, op } = pending;
        log::debug!("Worker[{}]: running '{}'", self.name, label);
        let reason = match catch_unwind(AssertUnwindSafe(op)) {
            Ok(Ok(())) => None,
            Ok(Err(Error::QueueSaturated)) => {
                // Backpressure from a nested enqueue, not a fault.
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_reason(payload.as_ref()))),
        };
        match reason {
            None => self.counters.completed(),
            Some(reason) => {
                self.counters.failed();
                log::error!("Worker[{}]: '{}' failed: {}", self.name, label, reason);
                failures.record(FailureEntry::new(clock.now(), label, &reason));
            }
        }
    }
}

/// The thread draining one [`OperationQueue`].
pub struct Worker {
    queue: Arc<OperationQueue>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        queue: Arc<OperationQueue>,
        poll_interval: Duration,
        clock: Arc<dyn ClockPort>,
        failures: Arc<FailureLog>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_queue = Arc::clone(&queue);
        let thread_stop = Arc::clone(&stop);
        let name = queue.name();

        let handle = std::thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                log::info!("Worker[{name}]: started");
                while !thread_stop.load(Ordering::Acquire) {
                    match thread_queue.take() {
                        Some(pending) => {
                            thread_queue.run(pending, clock.as_ref(), &failures);
                            thread_queue.finish();
                        }
                        None => std::thread::sleep(poll_interval),
                    }
                }
                log::info!("Worker[{name}]: stopped");
            })
            .map_err(|_| Error::ThreadSpawn("worker"))?;

        Ok(Self {
            queue,
            stop,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Block until the queue is idle or `timeout` elapses.  Returns
    /// whether it went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.is_idle() {
                return true;
            }
            if !self.is_alive() || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Drain and stop: discard the pending operation, let an in-flight
    /// one finish, then join the thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.discard_pending();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker[{}]: thread terminated abnormally", self.queue.name());
            }
        }
        // An operation enqueued by the last in-flight one is never run.
        self.queue.discard_pending();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
