//! Constants used throughout the application
//! This module contains the constant values used by the BLE client,
//! such as UUIDs of the demo peripheral, timeouts, and scan defaults.

use uuid::Uuid;

/// The UUID of the capture-the-flag demo service
pub const UUID_CTF_SERVICE: Uuid = Uuid::from_u128(0x8c380000_10bd_4fdb_ba21_1922d6cf860d);

/// The characteristic holding the password string (read)
pub const UUID_PASSWORD_CHAR: Uuid = Uuid::from_u128(0x8c380001_10bd_4fdb_ba21_1922d6cf860d);

/// The characteristic accepting the player's name (write)
pub const UUID_NAME_CHAR: Uuid = Uuid::from_u128(0x8c380002_10bd_4fdb_ba21_1922d6cf860d);

/// Name written by `write_name` when the configuration does not override it
pub const DEFAULT_PLAYER_NAME: &str = "Alice";

/// Scan duration of the demo runner in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Timeout for a pending GATT operation in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Time allowed for a connection attempt, in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;
