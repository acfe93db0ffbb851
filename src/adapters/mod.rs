//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements  | Connects to                     |
//! |----------------|-------------|---------------------------------|
//! | `file_store`   | StoragePort | files under a state directory   |
//! | `log_sink`     | EventSink   | `log` output                    |
//! | `memory_store` | StoragePort | process memory                  |
//! | `sim_device`   | DevicePort  | logistic growth model           |
//! | `time`         | ClockPort   | system clock / manual test clock|

pub mod file_store;
pub mod log_sink;
pub mod memory_store;
pub mod sim_device;
pub mod time;
