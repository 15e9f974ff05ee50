//! Seam between the client core and the platform Bluetooth stack.
//!
//! Every gateway call only *issues* a request. Outcomes are delivered later
//! as events on the callback channel handed over with `start_scan` or
//! `connect`, from whatever task the gateway runs them on.

use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::{PeripheralIdentity, ScanResult, ServiceTree};

/// Raw scan callbacks
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Discovered(ScanResult),
    /// Several results delivered together
    Batch(Vec<ScanResult>),
    Failed(String),
}

/// Per-peripheral GATT callbacks
#[derive(Debug, Clone)]
pub enum GattEvent {
    Connected,
    ConnectFailed(String),
    Disconnected,
    ServicesDiscovered(ServiceTree),
    DiscoveryFailed(String),
    CharacteristicRead {
        characteristic: Uuid,
        result: Result<Vec<u8>, String>,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        result: Result<(), String>,
    },
}

pub type ScanCallback = mpsc::UnboundedSender<ScanEvent>;
pub type GattCallback = mpsc::UnboundedSender<GattEvent>;

/// Commands understood by the radio adapter.
///
/// An `Err` means the request could not even be issued; callers treat it
/// the same way as a failure callback.
#[async_trait::async_trait]
pub trait RadioGateway: Send + Sync {
    async fn start_scan(&self, callback: ScanCallback) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Connects and registers `callback` for every later event of this peripheral
    async fn connect(&self, peripheral: &PeripheralIdentity, callback: GattCallback) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralIdentity) -> Result<()>;

    async fn discover_services(&self, peripheral: &PeripheralIdentity) -> Result<()>;

    async fn read_characteristic(&self, peripheral: &PeripheralIdentity, characteristic: Uuid) -> Result<()>;

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralIdentity,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording gateway for unit tests. Tests drive callbacks by hand.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum GatewayCall {
        StartScan,
        StopScan,
        Connect(String),
        Disconnect(String),
        DiscoverServices(String),
        Read(Uuid),
        Write(Uuid, Vec<u8>),
    }

    #[derive(Default)]
    pub struct FakeGateway {
        calls: Mutex<Vec<GatewayCall>>,
        scan_callback: Mutex<Option<ScanCallback>>,
        /// One callback per connect attempt, oldest first
        gatt_callbacks: Mutex<Vec<GattCallback>>,
        fail_scan_issue: bool,
        fail_connect_issue: bool,
        fail_gatt_issue: AtomicBool,
    }

    impl FakeGateway {
        /// Gateway whose `start_scan` cannot be issued
        pub fn failing_scans() -> Self {
            Self {
                fail_scan_issue: true,
                ..Default::default()
            }
        }

        /// Gateway whose `connect` cannot be issued
        pub fn failing_connects() -> Self {
            Self {
                fail_connect_issue: true,
                ..Default::default()
            }
        }

        /// Makes discover/read/write fail to issue from now on
        pub fn fail_gatt_issue(&self, fail: bool) {
            self.fail_gatt_issue.store(fail, Ordering::SeqCst);
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }

        pub fn scan_event(&self, event: ScanEvent) {
            let callback = self.scan_callback.lock().unwrap();
            callback.as_ref().expect("scan not started").send(event).unwrap();
        }

        /// Delivers `event` on the latest connect attempt's callback
        pub fn gatt_event(&self, event: GattEvent) {
            let callbacks = self.gatt_callbacks.lock().unwrap();
            callbacks.last().expect("never connected").send(event).unwrap();
        }

        /// Delivers `event` on an earlier attempt's callback, which the
        /// controller may have dropped already
        pub fn gatt_event_on_attempt(&self, attempt: usize, event: GattEvent) {
            let callbacks = self.gatt_callbacks.lock().unwrap();
            let _ = callbacks[attempt].send(event);
        }

        fn check_gatt_issue(&self) -> Result<()> {
            if self.fail_gatt_issue.load(Ordering::SeqCst) {
                anyhow::bail!("GATT busy");
            }
            Ok(())
        }

        fn record(&self, call: GatewayCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait::async_trait]
    impl RadioGateway for FakeGateway {
        async fn start_scan(&self, callback: ScanCallback) -> Result<()> {
            self.record(GatewayCall::StartScan);
            if self.fail_scan_issue {
                anyhow::bail!("adapter is off");
            }
            *self.scan_callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.record(GatewayCall::StopScan);
            Ok(())
        }

        async fn connect(&self, peripheral: &PeripheralIdentity, callback: GattCallback) -> Result<()> {
            self.record(GatewayCall::Connect(peripheral.address.clone()));
            if self.fail_connect_issue {
                anyhow::bail!("adapter is off");
            }
            self.gatt_callbacks.lock().unwrap().push(callback);
            Ok(())
        }

        async fn disconnect(&self, peripheral: &PeripheralIdentity) -> Result<()> {
            self.record(GatewayCall::Disconnect(peripheral.address.clone()));
            Ok(())
        }

        async fn discover_services(&self, peripheral: &PeripheralIdentity) -> Result<()> {
            self.record(GatewayCall::DiscoverServices(peripheral.address.clone()));
            self.check_gatt_issue()
        }

        async fn read_characteristic(&self, _peripheral: &PeripheralIdentity, characteristic: Uuid) -> Result<()> {
            self.record(GatewayCall::Read(characteristic));
            self.check_gatt_issue()
        }

        async fn write_characteristic(
            &self,
            _peripheral: &PeripheralIdentity,
            characteristic: Uuid,
            value: Vec<u8>,
        ) -> Result<()> {
            self.record(GatewayCall::Write(characteristic, value));
            self.check_gatt_issue()
        }
    }
}
