//! [`RadioGateway`] backed by the platform adapter through `bluest`.
//!
//! `bluest` exposes async request/response calls; each one is run on its own
//! task and its outcome is forwarded to the registered callback channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::BLUETOOTH_OPERATION_TIMEOUT_SECS;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::gateway::{GattCallback, GattEvent, RadioGateway, ScanCallback, ScanEvent};
use crate::core::bluetooth::types::{GattService, PeripheralIdentity, ScanResult, ServiceTree};

const MAC_ADDRESS_PATTERN: &str = r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})";

/// An established (or establishing) link to one device
struct Link {
    device: Device,
    callback: GattCallback,
    /// Handles from the last service discovery, keyed by characteristic UUID
    characteristics: HashMap<Uuid, Characteristic>,
    watch_token: CancellationToken,
}

type DeviceMap = Arc<Mutex<HashMap<String, Device>>>;
type LinkMap = Arc<Mutex<HashMap<String, Link>>>;

pub struct BluestGateway {
    adapter: Adapter,
    /// Devices seen while scanning, keyed by platform device id
    devices: DeviceMap,
    links: LinkMap,
    scan_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BluestGateway {
    /// Opens the default adapter and waits until it is powered on.
    pub async fn new() -> Result<Self, BluetoothError> {
        let adapter = Adapter::default()
            .await
            .ok_or(BluetoothError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceMap,
        callback: ScanCallback,
        cancel_token: CancellationToken,
    ) {
        // already-connected devices never advertise, report them first
        match adapter.connected_devices().await {
            Ok(connected) => {
                for device in connected {
                    let peripheral = Self::identify(&device, None);
                    devices.lock().await.insert(peripheral.id.0.clone(), device);
                    let _ = callback.send(ScanEvent::Discovered(ScanResult::new(peripheral, None)));
                }
            }
            Err(e) => debug!("Could not list connected devices: {}", e),
        }

        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                let _ = callback.send(ScanEvent::Failed(e.to_string()));
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                            let peripheral =
                                Self::identify(&discovered.device, discovered.adv_data.local_name.clone());
                            devices
                                .lock()
                                .await
                                .insert(peripheral.id.0.clone(), discovered.device);
                            let result = ScanResult::new(peripheral, discovered.rssi);
                            if callback.send(ScanEvent::Discovered(result)).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            let _ = callback.send(ScanEvent::Failed("scan stream ended".into()));
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Scan task finished.");
    }

    fn identify(device: &Device, advertised_name: Option<String>) -> PeripheralIdentity {
        let id = device.id().to_string();
        let name = advertised_name.or_else(|| device.name().ok());
        let address = Self::extract_mac_address(&id).unwrap_or_else(|| id.clone());
        PeripheralIdentity::new(id, name, address)
    }

    fn extract_mac_address(device_id: &str) -> Option<String> {
        let re = Regex::new(MAC_ADDRESS_PATTERN).ok()?;
        re.find_iter(device_id)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }

    /// Forwards a lost connection to the callback and forgets the link,
    /// unless a newer attempt has replaced it in the meantime.
    async fn watch_connection(
        adapter: Adapter,
        device: Device,
        links: LinkMap,
        callback: GattCallback,
        cancel_token: CancellationToken,
    ) {
        let mut events = match adapter.device_connection_events(&device).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch connection of {}: {}", device.id(), e);
                return;
            }
        };

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(ConnectionEvent::Disconnected) => {
                        info!("Device {} lost connection", device.id());
                        let key = device.id().to_string();
                        let mut links = links.lock().await;
                        if links.get(&key).is_some_and(|link| link.callback.same_channel(&callback)) {
                            links.remove(&key);
                        }
                        let _ = callback.send(GattEvent::Disconnected);
                        break;
                    }
                    Some(ConnectionEvent::Connected) => {}
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    async fn discover(
        device: &Device,
    ) -> Result<(ServiceTree, HashMap<Uuid, Characteristic>), bluest::Error> {
        let mut services = Vec::new();
        let mut handles = HashMap::new();
        for service in device.services().await? {
            let characteristics = service.characteristics().await?;
            debug!("Available service: {}", service.uuid());
            services.push(GattService::new(
                service.uuid(),
                characteristics.iter().map(|c| c.uuid()),
            ));
            handles.extend(characteristics.into_iter().map(|c| (c.uuid(), c)));
        }
        Ok((ServiceTree::new(services), handles))
    }

    async fn link_parts(&self, peripheral: &PeripheralIdentity) -> Result<(Device, GattCallback)> {
        let links = self.links.lock().await;
        let link = links
            .get(&peripheral.id.0)
            .ok_or_else(|| anyhow!("Device {} is not connected", peripheral.address))?;
        Ok((link.device.clone(), link.callback.clone()))
    }

    async fn characteristic(
        &self,
        peripheral: &PeripheralIdentity,
        uuid: Uuid,
    ) -> Result<(Characteristic, GattCallback)> {
        let links = self.links.lock().await;
        let link = links
            .get(&peripheral.id.0)
            .ok_or_else(|| anyhow!("Device {} is not connected", peripheral.address))?;
        let characteristic = link
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic not found: {}", uuid))?;
        Ok((characteristic, link.callback.clone()))
    }
}

#[async_trait]
impl RadioGateway for BluestGateway {
    async fn start_scan(&self, callback: ScanCallback) -> Result<()> {
        let mut scan_task = self.scan_task.lock().await;
        if let Some((token, _)) = scan_task.take() {
            token.cancel();
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            callback,
            cancel_token.clone(),
        ));
        *scan_task = Some((cancel_token, handle));
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let Some((cancel_token, handle)) = self.scan_task.lock().await.take() else {
            info!("No active scan task handle found to wait for.");
            return Ok(());
        };

        cancel_token.cancel();
        match handle.await {
            Ok(()) => info!("Scan task finished after cancellation."),
            Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
            Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralIdentity, callback: GattCallback) -> Result<()> {
        let device = self
            .devices
            .lock()
            .await
            .get(&peripheral.id.0)
            .cloned()
            .ok_or_else(|| BluetoothError::UnknownPeripheral(peripheral.address.clone()))?;

        let watch_token = CancellationToken::new();
        let previous = self.links.lock().await.insert(
            peripheral.id.0.clone(),
            Link {
                device: device.clone(),
                callback: callback.clone(),
                characteristics: HashMap::new(),
                watch_token: watch_token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.watch_token.cancel();
        }

        let adapter = self.adapter.clone();
        let links = self.links.clone();
        tokio::spawn(async move {
            if !device.is_connected().await {
                info!("Initiating connection to {}...", device.id());
                let timeout = Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS);
                let outcome = tokio::select! {
                    result = tokio::time::timeout(timeout, adapter.connect_device(&device)) => match result {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err(format!("no connection after {}s", BLUETOOTH_OPERATION_TIMEOUT_SECS)),
                    },
                    _ = watch_token.cancelled() => {
                        debug!("Connection attempt to {} cancelled", device.id());
                        return;
                    }
                };
                if let Err(reason) = outcome {
                    let _ = callback.send(GattEvent::ConnectFailed(reason));
                    return;
                }
                // the attempt was abandoned while the platform completed it
                if watch_token.is_cancelled() {
                    if let Err(e) = adapter.disconnect_device(&device).await {
                        warn!("Could not drop abandoned connection to {}: {}", device.id(), e);
                    }
                    return;
                }
            }
            let _ = callback.send(GattEvent::Connected);
            Self::watch_connection(adapter, device, links, callback, watch_token).await;
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralIdentity) -> Result<()> {
        let Some(link) = self.links.lock().await.remove(&peripheral.id.0) else {
            return Err(anyhow!("Device {} not connected", peripheral.address));
        };
        link.watch_token.cancel();

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.disconnect_device(&link.device).await {
                warn!("Disconnect from {} reported: {}", link.device.id(), e);
            }
            let _ = link.callback.send(GattEvent::Disconnected);
        });
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralIdentity) -> Result<()> {
        let (device, callback) = self.link_parts(peripheral).await?;
        let links = self.links.clone();
        let key = peripheral.id.0.clone();

        tokio::spawn(async move {
            match Self::discover(&device).await {
                Ok((tree, handles)) => {
                    if let Some(link) = links.lock().await.get_mut(&key) {
                        link.characteristics = handles;
                    }
                    let _ = callback.send(GattEvent::ServicesDiscovered(tree));
                }
                Err(e) => {
                    let _ = callback.send(GattEvent::DiscoveryFailed(e.to_string()));
                }
            }
        });
        Ok(())
    }

    async fn read_characteristic(&self, peripheral: &PeripheralIdentity, characteristic: Uuid) -> Result<()> {
        let (handle, callback) = self.characteristic(peripheral, characteristic).await?;
        tokio::spawn(async move {
            let result = handle.read().await.map_err(|e| e.to_string());
            let _ = callback.send(GattEvent::CharacteristicRead {
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        let (handle, callback) = self.characteristic(peripheral, characteristic).await?;
        tokio::spawn(async move {
            let result = handle.write(&value).await.map_err(|e| e.to_string());
            let _ = callback.send(GattEvent::CharacteristicWritten {
                characteristic,
                result,
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_is_taken_from_the_end_of_the_device_id() {
        assert_eq!(
            BluestGateway::extract_mac_address(
                "BluetoothLE#BluetoothLEe0:d4:e8:aa:bb:cc-2c:ba:ba:01:02:03"
            ),
            Some("2C:BA:BA:01:02:03".to_string())
        );
        assert_eq!(
            BluestGateway::extract_mac_address("hci0/dev_AA-BB-CC-DD-EE-FF"),
            Some("AA-BB-CC-DD-EE-FF".to_string())
        );
        assert_eq!(BluestGateway::extract_mac_address("5E1A0C2F-UUID-ONLY"), None);
    }
}
