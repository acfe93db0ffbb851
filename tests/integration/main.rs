//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against the mock device.  No hardware is required.

mod engine_tests;
mod lifecycle_tests;
mod mock_hw;
mod scheduling_tests;
