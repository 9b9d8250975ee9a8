//! Host radio backend
//!
//! Implements the adapter traits on top of btleplug (BlueZ, CoreBluetooth or
//! WinRT depending on the platform).

use crate::domain::models::{
    display_id, AdapterState, Advertisement, Capability, DataPointInstance, ManufacturerData,
    PayloadSlot, PeripheralInfo, ServiceInstance,
};
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, AdapterEvent, BleAdapter, PeripheralLink,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CAPABILITY_FLAGS: [(CharPropFlags, Capability); 8] = [
    (CharPropFlags::BROADCAST, Capability::Broadcast),
    (CharPropFlags::READ, Capability::Read),
    (
        CharPropFlags::WRITE_WITHOUT_RESPONSE,
        Capability::WriteWithoutResponse,
    ),
    (CharPropFlags::WRITE, Capability::Write),
    (CharPropFlags::NOTIFY, Capability::Notify),
    (CharPropFlags::INDICATE, Capability::Indicate),
    (
        CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
        Capability::AuthenticatedSignedWrites,
    ),
    (
        CharPropFlags::EXTENDED_PROPERTIES,
        Capability::ExtendedProperties,
    ),
];

#[allow(unreachable_patterns)]
fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn to_data_point(characteristic: &Characteristic) -> DataPointInstance {
    DataPointInstance {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: CAPABILITY_FLAGS
            .iter()
            .filter(|(flag, _)| characteristic.properties.contains(*flag))
            .map(|(_, capability)| *capability)
            .collect(),
        last_payload: PayloadSlot::default(),
    }
}

/// Active scan parameters, shared with the event pump
#[derive(Default)]
struct ScanState {
    services: Vec<Uuid>,
    allow_duplicates: bool,
}

impl ScanState {
    fn matches(&self, advertised: &[Uuid]) -> bool {
        self.services.is_empty() || advertised.iter().any(|u| self.services.contains(u))
    }
}

pub struct BtleplugAdapter {
    // Dropping the manager can tear down the platform session
    _manager: Manager,
    adapter: Adapter,
    scan: Arc<Mutex<ScanState>>,
}

impl BtleplugAdapter {
    /// Open the host adapter at `index`
    pub async fn new(index: usize) -> Result<Self, AdapterError> {
        let manager = Manager::new()
            .await
            .map_err(|e| AdapterError::Scan(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| AdapterError::Scan(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .nth(index)
            .ok_or(AdapterError::Unavailable)?;

        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter {}: {}", index, name),
            Err(e) => warn!("Could not query adapter {}: {}", index, e),
        }

        Ok(Self {
            _manager: manager,
            adapter,
            scan: Arc::new(Mutex::new(ScanState::default())),
        })
    }
}

/// Turn a discovery into an observed peripheral if it passes the scan filter
async fn observe(
    adapter: &Adapter,
    scan: &Mutex<ScanState>,
    seen: &mut HashSet<PeripheralId>,
    id: PeripheralId,
) -> Option<AdapterEvent> {
    let allow_duplicates = scan.lock().ok()?.allow_duplicates;
    if !allow_duplicates && seen.contains(&id) {
        return None;
    }
    let peripheral = match adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            debug!("Discovered peripheral vanished: {}", e);
            return None;
        }
    };
    let link = BtleplugPeripheral::new(peripheral).await;

    let advertised: Vec<Uuid> = link.advertised_services.clone();
    {
        let scan = scan.lock().ok()?;
        if !scan.matches(&advertised) {
            return None;
        }
        if !scan.allow_duplicates && !seen.insert(id) {
            return None;
        }
    }
    Some(AdapterEvent::PeripheralObserved(Arc::new(link)))
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn state(&self) -> Result<AdapterState, AdapterError> {
        self.adapter
            .adapter_state()
            .await
            .map(map_state)
            .map_err(|e| AdapterError::Scan(e.to_string()))
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        let mut stream = self
            .adapter
            .events()
            .await
            .map_err(|e| AdapterError::Scan(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let scan = Arc::clone(&self.scan);

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    CentralEvent::StateUpdate(state) => {
                        Some(AdapterEvent::StateChanged(map_state(state)))
                    }
                    // Advertised services may only show up in a later update
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        observe(&adapter, &scan, &mut seen, id).await
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        seen.remove(&id);
                        Some(AdapterEvent::PeripheralDisconnected(id.to_string()))
                    }
                    _ => None,
                };
                if let Some(event) = forwarded {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(rx)
    }

    async fn start_scanning(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        if let Ok(mut scan) = self.scan.lock() {
            scan.services = services.to_vec();
            scan.allow_duplicates = allow_duplicates;
        }
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(|e| AdapterError::Scan(e.to_string()))
    }
}

pub struct BtleplugPeripheral {
    peripheral: Peripheral,
    info: PeripheralInfo,
    advertised_services: Vec<Uuid>,
}

impl BtleplugPeripheral {
    async fn new(peripheral: Peripheral) -> Self {
        let id = peripheral.id().to_string();
        let properties = match peripheral.properties().await {
            Ok(p) => p,
            Err(e) => {
                debug!("No properties for {}: {}", id, e);
                None
            }
        };

        let (info, advertised_services) = match properties {
            Some(props) => {
                let mut manufacturer_data: Vec<ManufacturerData> = props
                    .manufacturer_data
                    .iter()
                    .map(|(company_id, data)| ManufacturerData {
                        company_id: *company_id,
                        data: hex::encode(data),
                    })
                    .collect();
                manufacturer_data.sort_by_key(|m| m.company_id);

                let info = PeripheralInfo {
                    id,
                    address: props.address.to_string(),
                    advertisement: Advertisement {
                        local_name: props.local_name,
                        tx_power_level: props.tx_power_level,
                        service_uuids: props.services.iter().map(display_id).collect(),
                        manufacturer_data,
                    },
                    rssi: props.rssi,
                };
                (info, props.services)
            }
            None => (
                PeripheralInfo {
                    id,
                    address: "unknown".to_string(),
                    advertisement: Advertisement::default(),
                    rssi: None,
                },
                Vec::new(),
            ),
        };

        Self {
            peripheral,
            info,
            advertised_services,
        }
    }

    fn characteristic(&self, data_point: &DataPointInstance) -> Result<Characteristic, AdapterError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == data_point.uuid && c.service_uuid == data_point.service_uuid)
            .ok_or_else(|| AdapterError::NotFound(display_id(&data_point.uuid)))
    }
}

#[async_trait]
impl PeripheralLink for BtleplugPeripheral {
    fn info(&self) -> &PeripheralInfo {
        &self.info
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        let connected = self
            .peripheral
            .is_connected()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;
        if connected {
            return Ok(());
        }
        self.peripheral
            .connect()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }

    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceInstance>, AdapterError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| AdapterError::Gatt(e.to_string()))?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
            .map(|s| ServiceInstance {
                uuid: s.uuid,
                primary: s.primary,
                data_points: Vec::new(),
            })
            .collect())
    }

    async fn discover_data_points(
        &self,
        service: &ServiceInstance,
        filter: &[Uuid],
    ) -> Result<Vec<DataPointInstance>, AdapterError> {
        let found = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or_else(|| AdapterError::NotFound(display_id(&service.uuid)))?;
        Ok(found
            .characteristics
            .iter()
            .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
            .map(to_data_point)
            .collect())
    }

    async fn read(&self, data_point: &DataPointInstance) -> Result<Vec<u8>, AdapterError> {
        let characteristic = self.characteristic(data_point)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(|e| AdapterError::Gatt(e.to_string()))
    }

    async fn listen(
        &self,
        data_point: &DataPointInstance,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| AdapterError::Gatt(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = data_point.uuid;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn subscribe(&self, data_point: &DataPointInstance) -> Result<(), AdapterError> {
        let characteristic = self.characteristic(data_point)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| AdapterError::Gatt(e.to_string()))
    }
}
