//! End-to-end flow through the public API against a scripted peripheral that
//! answers every request immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use ble_client_lib::config::{AppConfig, PendingPolicy};
use ble_client_lib::core::bluetooth::{
    ConnectionSnapshot, ConnectionState, GattCallback, GattEvent, GattService, PeripheralIdentity,
    RadioGateway, ScanCallback, ScanEvent, ScanResult, ScanSession, ServiceTree, UUID_CTF_SERVICE,
    UUID_NAME_CHAR, UUID_PASSWORD_CHAR,
};
use ble_client_lib::state::AppState;
use tokio::sync::watch;
use uuid::Uuid;

const PASSWORD: &str = "flag{scan-connect-read}";

fn device(address: &str, name: &str) -> PeripheralIdentity {
    PeripheralIdentity::new(format!("dev_{address}"), Some(name.to_string()), address)
}

#[derive(Default)]
struct ScriptedGateway {
    gatt: Mutex<Option<GattCallback>>,
    written: Mutex<Vec<(Uuid, Vec<u8>)>>,
    /// GATT operations in the order they were issued
    issued: Mutex<Vec<&'static str>>,
}

impl ScriptedGateway {
    fn reply(&self, event: GattEvent) -> Result<()> {
        match self.gatt.lock().unwrap().as_ref() {
            Some(callback) => {
                let _ = callback.send(event);
                Ok(())
            }
            None => bail!("not connected"),
        }
    }
}

#[async_trait]
impl RadioGateway for ScriptedGateway {
    async fn start_scan(&self, callback: ScanCallback) -> Result<()> {
        let ctf = device("C0:FF:EE:00:00:01", "CTF");
        let other = device("C0:FF:EE:00:00:02", "Headphones");
        callback.send(ScanEvent::Discovered(ScanResult::new(ctf.clone(), Some(-48))))?;
        callback.send(ScanEvent::Batch(vec![
            ScanResult::new(other, Some(-80)),
            ScanResult::new(ctf, Some(-47)),
        ]))?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, _peripheral: &PeripheralIdentity, callback: GattCallback) -> Result<()> {
        callback.send(GattEvent::Connected)?;
        *self.gatt.lock().unwrap() = Some(callback);
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &PeripheralIdentity) -> Result<()> {
        self.reply(GattEvent::Disconnected)
    }

    async fn discover_services(&self, _peripheral: &PeripheralIdentity) -> Result<()> {
        self.issued.lock().unwrap().push("discover");
        self.reply(GattEvent::ServicesDiscovered(ServiceTree::new(vec![GattService::new(
            UUID_CTF_SERVICE,
            [UUID_PASSWORD_CHAR, UUID_NAME_CHAR],
        )])))
    }

    async fn read_characteristic(&self, _peripheral: &PeripheralIdentity, characteristic: Uuid) -> Result<()> {
        self.issued.lock().unwrap().push("read");
        self.reply(GattEvent::CharacteristicRead {
            characteristic,
            result: Ok(PASSWORD.as_bytes().to_vec()),
        })
    }

    async fn write_characteristic(
        &self,
        _peripheral: &PeripheralIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        self.issued.lock().unwrap().push("write");
        self.written.lock().unwrap().push((characteristic, value));
        self.reply(GattEvent::CharacteristicWritten {
            characteristic,
            result: Ok(()),
        })
    }
}

async fn wait_scan(rx: &mut watch::Receiver<ScanSession>, f: impl FnMut(&ScanSession) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
        .await
        .expect("timed out waiting for scan state")
        .expect("scanner dropped");
}

async fn wait_connection(
    rx: &mut watch::Receiver<ConnectionSnapshot>,
    f: impl FnMut(&ConnectionSnapshot) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
        .await
        .expect("timed out waiting for connection state")
        .expect("controller task ended");
}

#[tokio::test]
async fn scan_select_connect_read_write() {
    let gateway = Arc::new(ScriptedGateway::default());
    let state = AppState::with_gateway(gateway.clone(), &AppConfig::default());
    let manager_arc = state.get_bluetooth_manager_arc();
    let mut manager = manager_arc.lock().await;

    let mut scan = manager.subscribe_scan();
    manager.start_scan().await;
    wait_scan(&mut scan, |s| s.discovered.len() == 2).await;
    manager.stop_scan().await;

    let found = manager.snapshot().found_devices;
    assert_eq!(found[0].address, "C0:FF:EE:00:00:01");
    assert_eq!(found[1].display_name(), "Headphones");

    manager.select_device(Some(found[0].clone())).await;
    let mut connection = manager.subscribe_connection().unwrap();

    manager.connect_active().await.unwrap();
    wait_connection(&mut connection, |s| s.is_connected()).await;
    manager.discover_active_services().await.unwrap();
    wait_connection(&mut connection, |s| !s.services.is_empty()).await;

    manager.read_password().await.unwrap();
    wait_connection(&mut connection, |s| s.last_read_value.is_some()).await;
    for expected in 1..=3 {
        manager.write_name().await.unwrap();
        wait_connection(&mut connection, |s| s.successful_write_count == expected).await;
    }

    let snapshot = manager.snapshot();
    assert!(!snapshot.is_scanning);
    assert!(snapshot.is_device_connected);
    assert_eq!(snapshot.password.as_deref(), Some(PASSWORD));
    assert_eq!(snapshot.name_written_times, 3);
    assert_eq!(
        snapshot.discovered_characteristics[&UUID_CTF_SERVICE.to_string()],
        [UUID_PASSWORD_CHAR.to_string(), UUID_NAME_CHAR.to_string()]
    );
    assert_eq!(
        gateway.written.lock().unwrap().as_slice(),
        vec![(UUID_NAME_CHAR, b"Alice".to_vec()); 3].as_slice()
    );

    manager.disconnect_active().await.unwrap();
    wait_connection(&mut connection, |s| s.state == ConnectionState::Disconnected).await;
    let snapshot = manager.snapshot();
    assert!(snapshot.discovered_characteristics.is_empty());
    assert_eq!(snapshot.password.as_deref(), Some(PASSWORD));

    manager.shutdown().await;
}

#[tokio::test]
async fn queued_requests_complete_in_order() {
    let gateway = Arc::new(ScriptedGateway::default());
    let mut config = AppConfig::default();
    config.connection.pending_policy = PendingPolicy::Queue;
    let state = AppState::with_gateway(gateway.clone(), &config);
    let mut manager = state.bluetooth_manager.lock().await;

    manager
        .select_device(Some(device("C0:FF:EE:00:00:01", "CTF")))
        .await;
    let mut connection = manager.subscribe_connection().unwrap();
    manager.connect_active().await.unwrap();
    wait_connection(&mut connection, |s| s.is_connected()).await;

    manager.discover_active_services().await.unwrap();
    wait_connection(&mut connection, |s| !s.services.is_empty()).await;

    // the scripted peripheral answers at once, so these never wait long in the queue,
    // but each is accepted instead of being rejected as busy
    manager.read_password().await.unwrap();
    manager.write_name().await.unwrap();
    manager.write_name().await.unwrap();
    wait_connection(&mut connection, |s| {
        s.successful_write_count == 2 && s.pending.is_none() && s.queued == 0
    })
    .await;

    assert_eq!(manager.snapshot().password.as_deref(), Some(PASSWORD));
    assert_eq!(
        gateway.issued.lock().unwrap().as_slice(),
        ["discover", "read", "write", "write"]
    );
    manager.shutdown().await;
}
