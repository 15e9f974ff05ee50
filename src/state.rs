//! Application state management
//! This module defines and manages the global application state.

use std::sync::Arc;
use tokio::sync::Mutex;
use anyhow::Result;
use log::info;

use crate::config::AppConfig;
use crate::core::BluetoothManager;
use crate::core::bluetooth::{BluestGateway, RadioGateway};

/// Global application state
pub struct AppState {
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<Mutex<BluetoothManager>>,
}

impl AppState {
    /// Creates a new AppState on the system's default adapter
    pub async fn new(config: &AppConfig) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let gateway = BluestGateway::new().await?;
        Ok(Self::with_gateway(Arc::new(gateway), config))
    }

    /// Creates a new AppState on any gateway, e.g. a simulated radio
    pub fn with_gateway(gateway: Arc<dyn RadioGateway>, config: &AppConfig) -> Self {
        let manager = BluetoothManager::new(gateway, config);
        Self {
            bluetooth_manager: Arc::new(Mutex::new(manager)),
        }
    }

    /// Gets a reference to the Bluetooth manager
    pub fn get_bluetooth_manager_arc(&self) -> Arc<Mutex<BluetoothManager>> {
        self.bluetooth_manager.clone()
    }
}
