//! Bluetooth manager for the BLE client
//! This module provides the main interface for bluetooth operations

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::config::connection_config::ConnectionConfig;
use crate::core::bluetooth::connection::ConnectionController;
use crate::core::bluetooth::error::{BluetoothError, Result};
use crate::core::bluetooth::gateway::RadioGateway;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{ClientSnapshot, ConnectionSnapshot, PeripheralIdentity, ScanSession};

/// Manages Bluetooth operations
pub struct BluetoothManager {
    gateway: Arc<dyn RadioGateway>,
    connection_config: ConnectionConfig,
    /// Bluetooth scanner
    scanner: BluetoothScanner,
    /// Controller for the selected device, if any
    active: Option<ConnectionController>,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager. Must be called from within a tokio runtime.
    pub fn new(gateway: Arc<dyn RadioGateway>, config: &AppConfig) -> Self {
        let scanner = BluetoothScanner::new(gateway.clone(), config.scan.clone());
        Self {
            gateway,
            connection_config: config.connection.clone(),
            scanner,
            active: None,
        }
    }

    pub async fn start_scan(&self) {
        self.scanner.start().await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop().await
    }

    pub fn clear_results(&self) {
        self.scanner.clear_results()
    }

    pub fn subscribe_scan(&self) -> watch::Receiver<ScanSession> {
        self.scanner.subscribe()
    }

    /// Receiver for the active device's connection state
    pub fn subscribe_connection(&self) -> Option<watch::Receiver<ConnectionSnapshot>> {
        self.active.as_ref().map(ConnectionController::subscribe)
    }

    /// Makes `device` the active device. The previous controller, if any, is
    /// shut down first; selecting the current device again keeps it.
    pub async fn select_device(&mut self, device: Option<PeripheralIdentity>) {
        if self.active.as_ref().map(ConnectionController::peripheral) == device.as_ref() {
            return;
        }

        if let Some(previous) = self.active.take() {
            info!("Releasing previously selected device {}", previous.peripheral().address);
            previous.shutdown().await;
        }

        self.active = device.map(|device| {
            info!("Selected device {} ({})", device.address, device.display_name());
            ConnectionController::new(device, self.gateway.clone(), &self.connection_config)
        });
    }

    pub fn active_device(&self) -> Option<&PeripheralIdentity> {
        self.active.as_ref().map(ConnectionController::peripheral)
    }

    pub async fn connect_active(&self) -> Result<()> {
        self.active()?.connect().await
    }

    pub async fn disconnect_active(&self) -> Result<()> {
        self.active()?.disconnect().await
    }

    pub async fn discover_active_services(&self) -> Result<()> {
        self.active()?.discover_services().await
    }

    pub async fn read_password(&self) -> Result<()> {
        self.active()?.read_password().await
    }

    /// Writes the configured player name
    pub async fn write_name(&self) -> Result<()> {
        self.active()?
            .write_name(&self.connection_config.player_name)
            .await
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let session = self.scanner.session();
        let connection = self
            .active
            .as_ref()
            .map(ConnectionController::snapshot)
            .unwrap_or_default();

        ClientSnapshot {
            is_scanning: session.active,
            found_devices: session.discovered,
            active_device: self.active_device().cloned(),
            is_device_connected: connection.is_connected(),
            discovered_characteristics: connection.services.to_uuid_map(),
            password: connection.last_read_value,
            name_written_times: connection.successful_write_count,
        }
    }

    /// Stops an active scan and releases the active device.
    pub async fn shutdown(&mut self) {
        self.scanner.stop().await;
        if let Some(active) = self.active.take() {
            active.shutdown().await;
        }
        info!("Bluetooth manager shut down.");
    }

    fn active(&self) -> Result<&ConnectionController> {
        self.active.as_ref().ok_or(BluetoothError::NoActiveDevice)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::bluetooth::gateway::fake::{FakeGateway, GatewayCall};
    use crate::core::bluetooth::gateway::{GattEvent, ScanEvent};
    use crate::core::bluetooth::types::{GattService, ScanResult, ServiceTree};
    use uuid::Uuid;

    fn device(address: &str) -> PeripheralIdentity {
        PeripheralIdentity::new(format!("id-{address}"), Some("CTF".into()), address)
    }

    fn setup() -> (Arc<FakeGateway>, BluetoothManager) {
        let gateway = Arc::new(FakeGateway::default());
        let manager = BluetoothManager::new(gateway.clone(), &AppConfig::default());
        (gateway, manager)
    }

    async fn wait_connection(
        manager: &BluetoothManager,
        f: impl FnMut(&ConnectionSnapshot) -> bool,
    ) {
        let mut rx = manager.subscribe_connection().expect("no active device");
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
            .await
            .expect("timed out waiting for connection state")
            .expect("controller task ended");
    }

    #[tokio::test]
    async fn commands_without_active_device_fail() {
        let (_, manager) = setup();
        assert!(matches!(manager.connect_active().await, Err(BluetoothError::NoActiveDevice)));
        assert!(matches!(manager.read_password().await, Err(BluetoothError::NoActiveDevice)));
        assert!(matches!(manager.write_name().await, Err(BluetoothError::NoActiveDevice)));
        assert_eq!(manager.snapshot(), ClientSnapshot::default());
    }

    #[tokio::test]
    async fn snapshot_combines_scan_and_connection_state() {
        let (gateway, mut manager) = setup();
        let config = ConnectionConfig::default();
        let mut scan = manager.subscribe_scan();

        manager.start_scan().await;
        gateway.scan_event(ScanEvent::Discovered(ScanResult::new(device("A"), Some(-40))));
        tokio::time::timeout(Duration::from_secs(2), scan.wait_for(|s| !s.discovered.is_empty()))
            .await
            .unwrap()
            .unwrap();

        manager.select_device(Some(device("A"))).await;
        manager.connect_active().await.unwrap();
        gateway.gatt_event(GattEvent::Connected);
        wait_connection(&manager, |s| s.is_connected()).await;

        let service = Uuid::from_u128(0xabc);
        manager.discover_active_services().await.unwrap();
        gateway.gatt_event(GattEvent::ServicesDiscovered(ServiceTree::new(vec![
            GattService::new(service, [config.password_characteristic, config.name_characteristic]),
        ])));
        wait_connection(&manager, |s| !s.services.is_empty()).await;

        manager.read_password().await.unwrap();
        gateway.gatt_event(GattEvent::CharacteristicRead {
            characteristic: config.password_characteristic,
            result: Ok(b"flag{ble}".to_vec()),
        });
        wait_connection(&manager, |s| s.last_read_value.is_some()).await;

        manager.write_name().await.unwrap();
        assert_eq!(
            gateway.calls().last(),
            Some(&GatewayCall::Write(config.name_characteristic, b"Alice".to_vec()))
        );
        gateway.gatt_event(GattEvent::CharacteristicWritten {
            characteristic: config.name_characteristic,
            result: Ok(()),
        });
        wait_connection(&manager, |s| s.successful_write_count == 1).await;

        let snapshot = manager.snapshot();
        assert!(snapshot.is_scanning);
        assert_eq!(snapshot.found_devices, [device("A")]);
        assert_eq!(snapshot.active_device, Some(device("A")));
        assert!(snapshot.is_device_connected);
        assert_eq!(
            snapshot.discovered_characteristics.get(&service.to_string()).map(Vec::len),
            Some(2)
        );
        assert_eq!(snapshot.password.as_deref(), Some("flag{ble}"));
        assert_eq!(snapshot.name_written_times, 1);
    }

    #[tokio::test]
    async fn reselection_releases_previous_device_and_starts_fresh() {
        let (gateway, mut manager) = setup();
        manager.select_device(Some(device("A"))).await;
        manager.connect_active().await.unwrap();
        gateway.gatt_event(GattEvent::Connected);
        wait_connection(&manager, |s| s.is_connected()).await;

        // same device again keeps the session
        manager.select_device(Some(device("A"))).await;
        assert!(manager.snapshot().is_device_connected);

        manager.select_device(Some(device("B"))).await;
        assert_eq!(gateway.calls().last(), Some(&GatewayCall::Disconnect("A".into())));
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.active_device, Some(device("B")));
        assert!(!snapshot.is_device_connected);

        manager.select_device(None).await;
        assert!(manager.active_device().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_scan_and_disconnects() {
        let (gateway, mut manager) = setup();
        manager.start_scan().await;
        manager.select_device(Some(device("A"))).await;
        manager.connect_active().await.unwrap();
        gateway.gatt_event(GattEvent::Connected);
        wait_connection(&manager, |s| s.is_connected()).await;

        manager.shutdown().await;
        assert!(!manager.snapshot().is_scanning);
        assert!(manager.active_device().is_none());
        assert_eq!(gateway.count(|c| *c == GatewayCall::StopScan), 1);
        assert_eq!(gateway.count(|c| matches!(c, GatewayCall::Disconnect(_))), 1);
    }
}
