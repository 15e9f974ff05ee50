//! Core functionality for the BLE client

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, BluetoothScanner, ConnectionController};
