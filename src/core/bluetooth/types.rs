//! Defines shared data structures for the Bluetooth module.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use uuid::Uuid;

/// Platform-specific unique identifier for a peripheral (a bluest `DeviceId`
/// rendered as a string, or whatever handle a gateway uses).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a discovered Bluetooth peripheral.
///
/// Two identities are equal when their addresses are equal, whatever their
/// handle or advertised name.
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralIdentity {
    /// Opaque platform handle
    pub id: PeripheralId,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The address of the device (MAC address on most platforms, the platform id on macOS)
    pub address: String,
}

impl PeripheralIdentity {
    /// Creates a new PeripheralIdentity instance
    pub fn new(id: impl Into<String>, name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            id: PeripheralId(id.into()),
            name,
            address: address.into(),
        }
    }

    /// Name for display, `[Unnamed]` when the peripheral did not advertise one
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("[Unnamed]")
    }
}

impl PartialEq for PeripheralIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeripheralIdentity {}

impl Hash for PeripheralIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// One raw discovery report from the gateway
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub peripheral: PeripheralIdentity,
    /// The signal strength (RSSI) of the advertisement
    pub rssi: Option<i16>,
}

impl ScanResult {
    pub fn new(peripheral: PeripheralIdentity, rssi: Option<i16>) -> Self {
        Self { peripheral, rssi }
    }
}

/// Observable state of the scanner
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSession {
    pub active: bool,
    /// Discovered peripherals in order of first sight, unique by address
    pub discovered: Vec<PeripheralIdentity>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(|uuid| GattCharacteristic { uuid })
                .collect(),
        }
    }
}

/// The discovered service/characteristic tree of a peripheral.
/// Holds UUIDs only; values flow through read results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ServiceTree(pub Vec<GattService>);

impl ServiceTree {
    pub fn new(services: Vec<GattService>) -> Self {
        Self(services)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn services(&self) -> &[GattService] {
        &self.0
    }

    pub fn contains_characteristic(&self, uuid: Uuid) -> bool {
        self.0
            .iter()
            .any(|service| service.characteristics.iter().any(|c| c.uuid == uuid))
    }

    /// Service UUID → characteristic UUIDs, as strings
    pub fn to_uuid_map(&self) -> BTreeMap<String, Vec<String>> {
        self.0
            .iter()
            .map(|service| {
                (
                    service.uuid.to_string(),
                    service
                        .characteristics
                        .iter()
                        .map(|c| c.uuid.to_string())
                        .collect(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    DiscoverServices,
    Read,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DiscoverServices => "service discovery",
            Self::Read => "read",
            Self::Write => "write",
        };
        f.write_str(name)
    }
}

/// The single GATT operation awaiting its callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub kind: OperationKind,
    /// Target characteristic; `None` for service discovery
    pub characteristic: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The gateway reported the operation failed
    Rejected(String),
    /// No callback arrived within the configured operation timeout
    TimedOut,
    /// A queued request could no longer be issued when its turn came
    Dropped(String),
}

/// Last transient failure seen by a connection controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub kind: OperationKind,
    pub characteristic: Option<Uuid>,
    pub reason: FailureReason,
}

/// Everything a consumer can observe about one connection controller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub services: ServiceTree,
    pub pending: Option<PendingOperation>,
    /// Requests waiting behind the pending operation (queue policy only)
    pub queued: usize,
    pub last_read_value: Option<String>,
    pub successful_write_count: u32,
    pub last_failure: Option<OperationFailure>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// True while a GATT operation is in flight
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
}

/// Combined state for a presentation layer: scan results plus the active device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub is_scanning: bool,
    pub found_devices: Vec<PeripheralIdentity>,
    pub active_device: Option<PeripheralIdentity>,
    pub is_device_connected: bool,
    pub discovered_characteristics: BTreeMap<String, Vec<String>>,
    pub password: Option<String>,
    pub name_written_times: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_ignores_handle_and_name() {
        let a = PeripheralIdentity::new("id-1", Some("Left".into()), "AA:BB:CC:DD:EE:01");
        let b = PeripheralIdentity::new("id-2", None, "AA:BB:CC:DD:EE:01");
        let c = PeripheralIdentity::new("id-1", Some("Left".into()), "AA:BB:CC:DD:EE:02");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn service_tree_lookup() {
        let c1 = Uuid::from_u128(0xc1);
        let tree = ServiceTree::new(vec![
            GattService::new(Uuid::from_u128(0x51), [Uuid::from_u128(0xc0)]),
            GattService::new(Uuid::from_u128(0x52), [c1]),
        ]);
        assert!(tree.contains_characteristic(c1));
        assert!(!tree.contains_characteristic(Uuid::from_u128(0xff)));
        assert_eq!(tree.to_uuid_map().len(), 2);
        assert!(!ServiceTree::default().contains_characteristic(c1));
    }

    #[test]
    fn unnamed_peripheral_display() {
        let p = PeripheralIdentity::new("id", None, "AA:BB:CC:DD:EE:FF");
        assert_eq!(p.display_name(), "[Unnamed]");
    }
}
