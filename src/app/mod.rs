//! Application core: experiment lifecycle, commands and events.
//!
//! All interaction with the bioreactor, the clock, storage and observers
//! happens through the **port traits** defined in [`ports`], keeping this
//! layer testable without real hardware.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
