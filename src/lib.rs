//! Replifactory culture control engine.
//!
//! Drives up to seven continuous-culture vials: a tick-based scheduler
//! dispatches measurement, culture-update and tubing-flush jobs onto two
//! single-slot worker queues, and each culture's dilution policy turns
//! its OD history into dilution requests.  Hardware, time, storage and
//! event observers are reached only through the traits in
//! [`app::ports`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod culture;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod jobs;
pub mod locks;
pub mod persistence;
pub mod queue;
pub mod scheduler;

pub use error::{Error, Result};
