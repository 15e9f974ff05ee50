use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_PLAYER_NAME, UUID_NAME_CHAR, UUID_PASSWORD_CHAR,
};

/// What a connection controller does with a GATT request that arrives while
/// another one is still waiting for its callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Fail the new request with `BluetoothError::Busy`
    #[default]
    Reject,
    /// Hold it and issue it once the pending operation completes
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub pending_policy: PendingPolicy,

    /// Pending operations without a callback after this many milliseconds are
    /// cleared as timed out. `None` waits until a disconnect.
    pub operation_timeout_ms: Option<u64>,

    /// Characteristic read by `read_password`
    pub password_characteristic: Uuid,

    /// Characteristic written by `write_name`
    pub name_characteristic: Uuid,

    /// Value written by `write_name`
    pub player_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            pending_policy: PendingPolicy::default(),
            operation_timeout_ms: Some(DEFAULT_OPERATION_TIMEOUT_MS),
            password_characteristic: UUID_PASSWORD_CHAR,
            name_characteristic: UUID_NAME_CHAR,
            player_name: DEFAULT_PLAYER_NAME.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}
