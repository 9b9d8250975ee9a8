//! In-process adapter for tests
//!
//! Peripherals are scripted up front (services, characteristics, values,
//! failing or never-answering operations); every call is recorded so tests can assert on what
//! a session or the scan controller asked for.

use crate::domain::models::{
    uuid_from_u16, AdapterState, Advertisement, Capability, DataPointInstance, PayloadSlot,
    PeripheralInfo, ServiceInstance,
};
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, AdapterEvent, BleAdapter, PeripheralLink,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A recorded peripheral operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    DiscoverServices,
    DiscoverDataPoints(Uuid),
    Read(Uuid),
    Listen(Uuid),
    Subscribe(Uuid),
}

pub struct MockPeripheral {
    info: PeripheralInfo,
    services: Vec<ServiceInstance>,
    values: HashMap<Uuid, Vec<u8>>,
    failures: HashMap<Op, AdapterError>,
    stalls: HashSet<Op>,
    calls: Mutex<Vec<Op>>,
    listeners: Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MockPeripheral {
    pub fn new(id: &str) -> Self {
        Self {
            info: PeripheralInfo {
                id: id.to_string(),
                address: "unknown".to_string(),
                advertisement: Advertisement::default(),
                rssi: Some(-60),
            },
            services: Vec::new(),
            values: HashMap::new(),
            failures: HashMap::new(),
            stalls: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_service(mut self, service: u16) -> Self {
        self.services.push(ServiceInstance {
            uuid: uuid_from_u16(service),
            primary: true,
            data_points: Vec::new(),
        });
        self
    }

    pub fn with_data_point(mut self, service: u16, data_point: u16, caps: &[Capability]) -> Self {
        let service_uuid = uuid_from_u16(service);
        if let Some(svc) = self.services.iter_mut().find(|s| s.uuid == service_uuid) {
            svc.data_points.push(DataPointInstance {
                uuid: uuid_from_u16(data_point),
                service_uuid,
                properties: caps.iter().copied().collect::<BTreeSet<_>>(),
                last_payload: PayloadSlot::default(),
            });
        }
        self
    }

    pub fn with_value(mut self, data_point: u16, value: Vec<u8>) -> Self {
        self.values.insert(uuid_from_u16(data_point), value);
        self
    }

    pub fn failing(mut self, op: Op, error: AdapterError) -> Self {
        self.failures.insert(op, error);
        self
    }

    /// Make `op` record itself and then never answer
    pub fn stalling(mut self, op: Op) -> Self {
        self.stalls.insert(op);
        self
    }

    pub fn calls(&self) -> Vec<Op> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Deliver a value push to every listener of a characteristic
    pub fn push(&self, data_point: u16, value: Vec<u8>) {
        if let Ok(listeners) = self.listeners.lock() {
            for tx in listeners.get(&uuid_from_u16(data_point)).into_iter().flatten() {
                let _ = tx.send(value.clone());
            }
        }
    }

    async fn record(&self, op: Op) -> Result<(), AdapterError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(op.clone());
        }
        if self.stalls.contains(&op) {
            std::future::pending::<()>().await;
        }
        match self.failures.get(&op) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PeripheralLink for MockPeripheral {
    fn info(&self) -> &PeripheralInfo {
        &self.info
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.record(Op::Connect).await
    }

    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceInstance>, AdapterError> {
        self.record(Op::DiscoverServices).await?;
        Ok(self
            .services
            .iter()
            .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
            .map(|s| ServiceInstance {
                data_points: Vec::new(),
                ..s.clone()
            })
            .collect())
    }

    async fn discover_data_points(
        &self,
        service: &ServiceInstance,
        filter: &[Uuid],
    ) -> Result<Vec<DataPointInstance>, AdapterError> {
        self.record(Op::DiscoverDataPoints(service.uuid)).await?;
        let svc = self
            .services
            .iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or_else(|| AdapterError::NotFound(service.uuid.to_string()))?;
        Ok(svc
            .data_points
            .iter()
            .filter(|d| filter.is_empty() || filter.contains(&d.uuid))
            .map(|d| DataPointInstance {
                last_payload: PayloadSlot::default(),
                ..d.clone()
            })
            .collect())
    }

    async fn read(&self, data_point: &DataPointInstance) -> Result<Vec<u8>, AdapterError> {
        self.record(Op::Read(data_point.uuid)).await?;
        Ok(self.values.get(&data_point.uuid).cloned().unwrap_or_default())
    }

    async fn listen(
        &self,
        data_point: &DataPointInstance,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
        self.record(Op::Listen(data_point.uuid)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.entry(data_point.uuid).or_default().push(tx);
        }
        Ok(rx)
    }

    async fn subscribe(&self, data_point: &DataPointInstance) -> Result<(), AdapterError> {
        self.record(Op::Subscribe(data_point.uuid)).await
    }
}

/// A recorded `start_scanning` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub services: Vec<Uuid>,
    pub allow_duplicates: bool,
}

pub struct MockAdapter {
    state: Mutex<AdapterState>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<AdapterEvent>>>,
    scans: Mutex<Vec<ScanRequest>>,
    scan_failures: Mutex<VecDeque<AdapterError>>,
}

impl MockAdapter {
    pub fn new(state: AdapterState) -> Self {
        Self {
            state: Mutex::new(state),
            feeds: Mutex::new(Vec::new()),
            scans: Mutex::new(Vec::new()),
            scan_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next `start_scanning` call fail
    pub fn fail_next_scan(&self, error: AdapterError) {
        if let Ok(mut failures) = self.scan_failures.lock() {
            failures.push_back(error);
        }
    }

    pub fn scans(&self) -> Vec<ScanRequest> {
        self.scans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn broadcast(&self, event: AdapterEvent) {
        if let Ok(feeds) = self.feeds.lock() {
            for tx in feeds.iter() {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn set_state(&self, state: AdapterState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        self.broadcast(AdapterEvent::StateChanged(state));
    }

    pub fn observe(&self, peripheral: Arc<MockPeripheral>) {
        self.broadcast(AdapterEvent::PeripheralObserved(peripheral));
    }

    pub fn disconnect(&self, id: &str) {
        self.broadcast(AdapterEvent::PeripheralDisconnected(id.to_string()));
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn state(&self) -> Result<AdapterState, AdapterError> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| AdapterError::Unavailable)
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .map_err(|_| AdapterError::Unavailable)?
            .push(tx);
        Ok(rx)
    }

    async fn start_scanning(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        if let Ok(mut scans) = self.scans.lock() {
            scans.push(ScanRequest {
                services: services.to_vec(),
                allow_duplicates,
            });
        }
        let failure = self
            .scan_failures
            .lock()
            .ok()
            .and_then(|mut f| f.pop_front());
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
