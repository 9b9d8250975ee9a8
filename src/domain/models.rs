use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_ID_MASK: u128 = 0xffff_ffff << 96;

/// Expand an assigned 16-bit number to its full UUID
pub fn uuid_from_u16(id: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(id) << 96))
}

/// The assigned 16-bit number of a UUID built on the Bluetooth base, if any
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_ID_MASK != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Render an attribute UUID the way target ids show it: `2a37` for assigned
/// numbers, the hyphenated form otherwise
pub fn display_id(uuid: &Uuid) -> String {
    match short_id(uuid) {
        Some(id) => format!("{:04x}", id),
        None => uuid.hyphenated().to_string(),
    }
}

/// Readiness of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "poweredOff",
            Self::PoweredOn => "poweredOn",
        };
        f.write_str(s)
    }
}

/// Operations a characteristic supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

/// What an advertisement told us about a peripheral
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub tx_power_level: Option<i16>,
    pub service_uuids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manufacturer_data: Vec<ManufacturerData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturerData {
    pub company_id: u16,
    /// Hex encoded
    pub data: String,
}

/// An observed peripheral
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralInfo {
    pub id: String,
    /// Bluetooth address, or "unknown"
    pub address: String,
    pub advertisement: Advertisement,
    pub rssi: Option<i16>,
}

/// A service discovered on a connected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub uuid: Uuid,
    pub primary: bool,
    #[serde(skip)]
    pub data_points: Vec<DataPointInstance>,
}

impl ServiceInstance {
    pub fn short_id(&self) -> Option<u16> {
        short_id(&self.uuid)
    }
}

/// A characteristic discovered within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataPointInstance {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: BTreeSet<Capability>,
    /// Most recent raw payload, from a read or a push
    #[serde(skip)]
    pub last_payload: PayloadSlot,
}

/// Latest payload of one characteristic. Clones share the slot, so a push
/// listener can update the instance owned by its session.
#[derive(Debug, Clone, Default)]
pub struct PayloadSlot(Arc<Mutex<Option<Vec<u8>>>>);

impl PayloadSlot {
    pub fn set(&self, payload: Vec<u8>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(payload);
        }
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

impl PartialEq for PayloadSlot {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for PayloadSlot {}

impl DataPointInstance {
    pub fn short_id(&self) -> Option<u16> {
        short_id(&self.uuid)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.properties.contains(&capability)
    }

    /// Whether value changes are pushed (notify or indicate)
    pub fn is_pushed(&self) -> bool {
        self.can(Capability::Notify) || self.can(Capability::Indicate)
    }
}

/// Lifecycle of one discovery session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Observed,
    Connecting,
    Connected,
    EnumeratingServices,
    EnumeratingDataPoints,
    Active,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
