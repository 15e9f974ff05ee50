//! Errors returned synchronously by the Bluetooth command surface.
//! Hardware failures are not errors here; they show up as state.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::{ConnectionState, OperationKind};

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("operation requires a connected peripheral (currently {0})")]
    NotConnected(ConnectionState),

    #[error("characteristic {0} is not in the discovered service tree")]
    UnknownCharacteristic(Uuid),

    #[error("a {0} operation is already pending")]
    Busy(OperationKind),

    #[error("no active device selected")]
    NoActiveDevice,

    #[error("connection controller is no longer running")]
    ControllerClosed,

    #[error("no Bluetooth adapter found")]
    AdapterUnavailable,

    #[error("peripheral {0} has not been discovered by this adapter")]
    UnknownPeripheral(String),

    #[error(transparent)]
    Bluest(#[from] bluest::Error),
}

pub type Result<T, E = BluetoothError> = std::result::Result<T, E>;
