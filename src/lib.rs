//! BLE client library
//! Scans for peripherals, connects to one and reads/writes its characteristics.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
