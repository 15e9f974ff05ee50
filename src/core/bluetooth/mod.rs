//! Bluetooth functionality for the BLE client
//! This module handles scanning for peripherals, connecting to one, and
//! sequencing GATT operations against it.

pub mod bluest_gateway;
pub mod connection;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_gateway::BluestGateway;
pub use connection::ConnectionController;
pub use constants::*;
pub use error::BluetoothError;
pub use gateway::{GattCallback, GattEvent, RadioGateway, ScanCallback, ScanEvent};
pub use manager::BluetoothManager;
pub use scanner::BluetoothScanner;
pub use types::*;
