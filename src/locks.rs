//! Exclusive hardware resource locks.
//!
//! One lock per vial and one for the shared pump manifold.  Every
//! hardware-touching job holds the lock(s) of the resources it drives for
//! the whole device call.
//!
//! # Lock ordering
//!
//! A vial lock is always taken before the pump-manifold lock, never the
//! reverse, and no call chain takes the same lock twice.  Under that
//! discipline acquisition cannot deadlock, so a timeout is reported as
//! [`Error::ResourceContention`] and treated as a bug, not retried.
//!
//! Locks are not reentrant and carry no data; the culture map has its own
//! mutex that is never held across device I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::app::ports::VIAL_COUNT;
use crate::error::{Error, Resource, Result};

/// Back-off between acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

struct ResourceLock {
    mutex: Mutex<()>,
    held: AtomicBool,
}

impl ResourceLock {
    const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            held: AtomicBool::new(false),
        }
    }

    fn acquire(&self, resource: Resource, timeout: Duration) -> Result<ResourceGuard<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.mutex.try_lock() {
                Ok(guard) => return Ok(self.guard(resource, guard)),
                // A panicking holder was caught at the worker boundary; the
                // lock protects no data, so the poison carries no meaning.
                Err(TryLockError::Poisoned(p)) => return Ok(self.guard(resource, p.into_inner())),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        log::error!("Locks: timed out acquiring {resource}");
                        return Err(Error::ResourceContention(resource));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    fn guard<'a>(&'a self, resource: Resource, guard: MutexGuard<'a, ()>) -> ResourceGuard<'a> {
        self.held.store(true, Ordering::Release);
        ResourceGuard {
            resource,
            held: &self.held,
            _guard: guard,
        }
    }
}

/// Proof that a resource is held.  Releases on drop.
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct ResourceGuard<'a> {
    resource: Resource,
    held: &'a AtomicBool,
    _guard: MutexGuard<'a, ()>,
}

impl ResourceGuard<'_> {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        // Flag clears before the mutex field drops.
        self.held.store(false, Ordering::Release);
    }
}

/// Guards for one dilution: the vial, then the pump manifold.
pub struct DispenseGuard<'a> {
    // Field order is drop order: pumps release first.
    _pumps: ResourceGuard<'a>,
    _vial: ResourceGuard<'a>,
}

/// Which resources are currently held (for dashboards).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    /// `(vial, held)` for vials `1..=VIAL_COUNT`.
    pub vials: Vec<(u8, bool)>,
    pub pump_manifold: bool,
}

impl LockStatus {
    pub fn any_held(&self) -> bool {
        self.pump_manifold || self.vials.iter().any(|(_, held)| *held)
    }
}

/// The per-vial and pump-manifold lock set of one device.
pub struct ResourceLocks {
    vials: [ResourceLock; VIAL_COUNT as usize],
    pumps: ResourceLock,
    timeout: Duration,
}

impl ResourceLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            vials: [const { ResourceLock::new() }; VIAL_COUNT as usize],
            pumps: ResourceLock::new(),
            timeout,
        }
    }

    /// Lock one vial for a read/update cycle.
    pub fn vial(&self, vial: u8) -> Result<ResourceGuard<'_>> {
        let lock = self.vial_lock(vial)?;
        lock.acquire(Resource::Vial(vial), self.timeout)
    }

    /// Lock the pump manifold.  Callers that also need a vial must take
    /// the vial first (see [`Self::dispense`]).
    pub fn pumps(&self) -> Result<ResourceGuard<'_>> {
        self.pumps.acquire(Resource::PumpManifold, self.timeout)
    }

    /// Lock a vial and then the pump manifold, in that order.
    pub fn dispense(&self, vial: u8) -> Result<DispenseGuard<'_>> {
        let vial_guard = self.vial(vial)?;
        let pump_guard = self.pumps()?;
        Ok(DispenseGuard {
            _pumps: pump_guard,
            _vial: vial_guard,
        })
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            vials: (1..=VIAL_COUNT)
                .zip(self.vials.iter())
                .map(|(v, l)| (v, l.held.load(Ordering::Acquire)))
                .collect(),
            pump_manifold: self.pumps.held.load(Ordering::Acquire),
        }
    }

    fn vial_lock(&self, vial: u8) -> Result<&ResourceLock> {
        if vial == 0 || vial > VIAL_COUNT {
            return Err(Error::PolicyViolation(
                crate::error::PolicyViolation::VialOutOfRange(vial),
            ));
        }
        Ok(&self.vials[usize::from(vial - 1)])
    }
}
