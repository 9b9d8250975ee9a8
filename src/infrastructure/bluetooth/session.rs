//! Discovery Session
//!
//! Drives one peripheral from first sighting to an active set of
//! subscriptions and reads:
//!
//! ```text
//! Observed -> Connecting -> Connected -> EnumeratingServices
//!          -> EnumeratingDataPoints -> Active
//!     (any step) -> Failed(reason)
//! ```
//!
//! Each step is started only from the success of the previous one. A failed
//! step is emitted and its branch stops; sibling services and characteristics
//! carry on independently.

use crate::domain::decoder::{self, Reading};
use crate::domain::models::{
    display_id, short_id, Capability, DataPointInstance, PeripheralInfo, ServiceInstance,
    SessionState,
};
use crate::domain::registry;
use crate::infrastructure::bluetooth::adapter::PeripheralLink;
use crate::infrastructure::emit::{EmitSink, EmitSinkExt, RawBuffer};
use futures_util::future::{join, join_all};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Target id of a peripheral: `peripheral[<id>]`
pub fn peripheral_target(info: &PeripheralInfo) -> String {
    format!("peripheral[{}]", info.id)
}

fn service_target(peripheral: &str, service: &ServiceInstance) -> String {
    format!("{}.services[{}]", peripheral, display_id(&service.uuid))
}

fn data_point_target(service: &str, data_point: &DataPointInstance) -> String {
    format!("{}.characteristic[{}]", service, display_id(&data_point.uuid))
}

#[derive(Serialize)]
struct ServiceSummary {
    uuid: String,
    name: Option<&'static str>,
    #[serde(rename = "type")]
    type_tag: Option<&'static str>,
    primary: bool,
}

impl ServiceSummary {
    fn new(service: &ServiceInstance) -> Self {
        let definition = service.short_id().and_then(registry::lookup_service);
        Self {
            uuid: display_id(&service.uuid),
            name: definition.map(|d| d.name),
            type_tag: definition.map(|d| d.type_tag),
            primary: service.primary,
        }
    }
}

#[derive(Serialize)]
struct DataPointSummary<'a> {
    uuid: String,
    name: Option<&'static str>,
    #[serde(rename = "type")]
    type_tag: Option<&'static str>,
    properties: &'a BTreeSet<Capability>,
}

impl<'a> DataPointSummary<'a> {
    fn new(data_point: &'a DataPointInstance) -> Self {
        let definition = data_point.short_id().and_then(registry::lookup);
        Self {
            uuid: display_id(&data_point.uuid),
            name: definition.map(|d| d.name),
            type_tag: definition.map(|d| d.type_tag),
            properties: &data_point.properties,
        }
    }
}

/// Decode a payload for the characteristic `uuid` and emit it.
///
/// Characteristics outside the registry (including vendor 128-bit ones) are
/// emitted as `Raw`.
pub fn emit_reading(sink: &dyn EmitSink, target: &str, uuid: &Uuid, payload: &[u8]) {
    let reading = match short_id(uuid) {
        Some(id) => decoder::decode(id, payload),
        None => Reading::Raw(payload.to_vec()),
    };
    match reading {
        Reading::Parsed { value, .. } => sink.emit_value(target, "Parsed data", &value),
        Reading::Raw(bytes) => sink.emit_value(target, "Raw", &RawBuffer::new(&bytes)),
    }
}

/// Per-peripheral state machine
pub struct DiscoverySession {
    link: Arc<dyn PeripheralLink>,
    sink: Arc<dyn EmitSink>,
    target: String,
    state: SessionState,
    services: Vec<ServiceInstance>,
}

impl DiscoverySession {
    pub fn new(link: Arc<dyn PeripheralLink>, sink: Arc<dyn EmitSink>) -> Self {
        let target = peripheral_target(link.info());
        Self {
            link,
            sink,
            target,
            state: SessionState::Observed,
            services: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Services discovered so far, with their characteristics
    pub fn services(&self) -> &[ServiceInstance] {
        &self.services
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{}: {:?} -> {:?}", self.target, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, label: &str, reason: String) {
        warn!("{}: {} {}", self.target, label, reason);
        self.sink.emit_value(&self.target, label, &reason);
        self.transition(SessionState::Failed(reason));
    }

    /// Run every step up to `Active` (or `Failed`). Value pushes keep being
    /// emitted by background listeners after this returns.
    pub async fn run(&mut self) {
        self.sink
            .emit_value(&self.target, "Initializing peripheral", self.link.info());

        self.transition(SessionState::Connecting);
        self.sink.emit_label(&self.target, "Connecting...");
        if let Err(e) = self.link.connect().await {
            self.fail("Failed to connect", e.to_string());
            return;
        }
        self.transition(SessionState::Connected);
        info!("{}: connected", self.target);
        self.sink.emit_label(&self.target, "Connected!");

        // Empty filter: log every service present, not only known ones
        self.transition(SessionState::EnumeratingServices);
        let services = match self.link.discover_services(&[]).await {
            Ok(services) => services,
            Err(e) => {
                self.fail("Failed to discover services", e.to_string());
                return;
            }
        };
        self.sink.emit_label(&self.target, "Discovering services...");

        self.transition(SessionState::EnumeratingDataPoints);
        let this = &*self;
        let services = join_all(services.into_iter().map(|s| this.initialize_service(s))).await;
        self.services = services;
        self.transition(SessionState::Active);
    }

    async fn initialize_service(&self, mut service: ServiceInstance) -> ServiceInstance {
        let target = service_target(&self.target, &service);
        self.sink
            .emit_value(&target, "Initializing service", &ServiceSummary::new(&service));

        let data_points = match self.link.discover_data_points(&service, &[]).await {
            Ok(data_points) => data_points,
            Err(e) => {
                warn!("{}: characteristic discovery failed: {}", target, e);
                self.sink
                    .emit_value(&target, "Failed to discover characteristics", &e.to_string());
                return service;
            }
        };

        service.data_points = join_all(
            data_points
                .into_iter()
                .map(|dp| self.initialize_data_point(&target, dp)),
        )
        .await;
        service
    }

    async fn initialize_data_point(
        &self,
        service_target: &str,
        data_point: DataPointInstance,
    ) -> DataPointInstance {
        let target = data_point_target(service_target, &data_point);
        self.sink.emit_value(
            &target,
            "Initializing characteristic",
            &DataPointSummary::new(&data_point),
        );

        // Subscribe and read are independent: neither waits on the other's answer
        let subscribe = async {
            if data_point.is_pushed() {
                self.subscribe(&target, &data_point).await;
            }
        };
        let read = async {
            if data_point.can(Capability::Read) {
                self.read(&target, &data_point).await;
            }
        };
        join(subscribe, read).await;

        data_point
    }

    async fn read(&self, target: &str, data_point: &DataPointInstance) {
        self.sink.emit_label(target, "Reading...");
        match self.link.read(data_point).await {
            Ok(payload) => {
                emit_reading(self.sink.as_ref(), target, &data_point.uuid, &payload);
                data_point.last_payload.set(payload);
            }
            Err(e) => self
                .sink
                .emit_value(target, "Failed to read value", &e.to_string()),
        }
    }

    /// Attach the listener first so no push is missed, then subscribe
    async fn subscribe(&self, target: &str, data_point: &DataPointInstance) {
        let mut pushes = match self.link.listen(data_point).await {
            Ok(rx) => rx,
            Err(e) => {
                self.sink
                    .emit_value(target, "Failed to subscribe", &e.to_string());
                return;
            }
        };

        let sink = Arc::clone(&self.sink);
        let listener_target = target.to_string();
        let uuid = data_point.uuid;
        let slot = data_point.last_payload.clone();
        tokio::spawn(async move {
            while let Some(payload) = pushes.recv().await {
                slot.set(payload.clone());
                emit_reading(sink.as_ref(), &listener_target, &uuid, &payload);
            }
            debug!("{}: push feed closed", listener_target);
        });

        self.sink.emit_label(target, "Subscribing...");
        match self.link.subscribe(data_point).await {
            Ok(()) => self.sink.emit_label(target, "Subscribed!"),
            Err(e) => self
                .sink
                .emit_value(target, "Failed to subscribe", &e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::uuid_from_u16;
    use crate::infrastructure::bluetooth::adapter::AdapterError;
    use crate::infrastructure::bluetooth::mock::{MockPeripheral, Op};
    use crate::infrastructure::emit::{ChannelSink, Emission};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const HR_TARGET: &str = "peripheral[hrm-1].services[180d].characteristic[2a37]";
    const BATTERY_TARGET: &str = "peripheral[hrm-1].services[180f].characteristic[2a19]";

    fn drain(rx: &mut mpsc::UnboundedReceiver<Emission>) -> Vec<Emission> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn find<'a>(emissions: &'a [Emission], target: &str, label: &str) -> Option<&'a Emission> {
        emissions
            .iter()
            .find(|e| e.target == target && e.label == label)
    }

    fn heart_rate_monitor() -> MockPeripheral {
        MockPeripheral::new("hrm-1")
            .with_service(0x180D)
            .with_data_point(0x180D, 0x2A37, &[Capability::Notify])
            .with_data_point(0x180D, 0x2A38, &[Capability::Read])
            .with_service(0x180F)
            .with_data_point(0x180F, 0x2A19, &[Capability::Read, Capability::Notify])
            .with_value(0x2A38, vec![0x01])
            .with_value(0x2A19, vec![0x5A])
    }

    async fn run_session(peripheral: &Arc<MockPeripheral>) -> (DiscoverySession, Vec<Emission>) {
        let (sink, mut rx) = ChannelSink::channel();
        let mut session = DiscoverySession::new(peripheral.clone(), Arc::new(sink));
        session.run().await;
        (session, drain(&mut rx))
    }

    #[tokio::test]
    async fn test_reads_known_characteristics() {
        let peripheral = Arc::new(heart_rate_monitor());
        let (session, emissions) = run_session(&peripheral).await;

        assert_eq!(session.state(), &SessionState::Active);
        assert_eq!(session.services().len(), 2);

        let location = find(
            &emissions,
            "peripheral[hrm-1].services[180d].characteristic[2a38]",
            "Parsed data",
        )
        .unwrap();
        assert_eq!(location.payload, Some(json!("Chest")));

        let battery = find(&emissions, BATTERY_TARGET, "Parsed data").unwrap();
        assert_eq!(battery.payload, Some(json!(90)));

        let svc = find(
            &emissions,
            "peripheral[hrm-1].services[180d]",
            "Initializing service",
        )
        .unwrap();
        assert_eq!(svc.payload.as_ref().unwrap()["name"], json!("Heart Rate"));
    }

    #[tokio::test]
    async fn test_notify_and_read_both_happen() {
        let peripheral = Arc::new(heart_rate_monitor());
        let (_, _) = run_session(&peripheral).await;

        let battery = uuid_from_u16(0x2A19);
        let calls = peripheral.calls();
        assert!(calls.contains(&Op::Listen(battery)));
        assert!(calls.contains(&Op::Subscribe(battery)));
        assert!(calls.contains(&Op::Read(battery)));
        // Notify-only characteristic is never read
        assert!(!calls.contains(&Op::Read(uuid_from_u16(0x2A37))));
    }

    #[tokio::test]
    async fn test_read_does_not_wait_for_stalled_subscribe() {
        let battery = uuid_from_u16(0x2A19);
        let peripheral = Arc::new(heart_rate_monitor().stalling(Op::Subscribe(battery)));
        let (sink, mut rx) = ChannelSink::channel();
        let link = peripheral.clone();
        let task = tokio::spawn(async move {
            let mut session = DiscoverySession::new(link, Arc::new(sink));
            session.run().await;
        });

        let reading = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let e = rx.recv().await.unwrap();
                if e.target == BATTERY_TARGET && e.label == "Parsed data" {
                    break e;
                }
            }
        })
        .await
        .expect("battery read blocked behind subscribe");

        assert_eq!(reading.payload, Some(json!(90)));
        let calls = peripheral.calls();
        assert!(calls.contains(&Op::Subscribe(battery)));
        assert!(calls.contains(&Op::Read(battery)));
        // The stalled subscribe keeps the session from reaching Active
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_read_happens_when_listener_fails() {
        let battery = uuid_from_u16(0x2A19);
        let peripheral = Arc::new(
            heart_rate_monitor().failing(Op::Listen(battery), AdapterError::Gatt("no cccd".into())),
        );
        let (session, emissions) = run_session(&peripheral).await;

        assert_eq!(session.state(), &SessionState::Active);
        let calls = peripheral.calls();
        assert!(calls.contains(&Op::Read(battery)));
        assert!(!calls.contains(&Op::Subscribe(battery)));
        let failed = find(&emissions, BATTERY_TARGET, "Failed to subscribe").unwrap();
        assert_eq!(failed.payload, Some(json!("GATT error: no cccd")));
        assert!(find(&emissions, BATTERY_TARGET, "Parsed data").is_some());
    }

    #[tokio::test]
    async fn test_pushed_values_update_last_payload() {
        let peripheral = Arc::new(heart_rate_monitor());
        let (sink, mut rx) = ChannelSink::channel();
        let mut session = DiscoverySession::new(peripheral.clone(), Arc::new(sink));
        session.run().await;
        drain(&mut rx);

        peripheral.push(0x2A19, vec![0x50]);
        loop {
            let e = rx.recv().await.unwrap();
            if e.target == BATTERY_TARGET && e.payload == Some(json!(80)) {
                break;
            }
        }

        let battery = session
            .services()
            .iter()
            .flat_map(|s| s.data_points.iter())
            .find(|dp| dp.short_id() == Some(0x2A19))
            .unwrap();
        assert_eq!(battery.last_payload.get(), Some(vec![0x50]));
    }

    #[tokio::test]
    async fn test_listener_attached_before_subscribe() {
        let peripheral = Arc::new(heart_rate_monitor());
        run_session(&peripheral).await;

        let hr = uuid_from_u16(0x2A37);
        let calls = peripheral.calls();
        let listen = calls.iter().position(|c| *c == Op::Listen(hr)).unwrap();
        let subscribe = calls.iter().position(|c| *c == Op::Subscribe(hr)).unwrap();
        assert!(listen < subscribe);
    }

    #[tokio::test]
    async fn test_pushed_values_are_decoded() {
        let peripheral = Arc::new(heart_rate_monitor());
        let (sink, mut rx) = ChannelSink::channel();
        let mut session = DiscoverySession::new(peripheral.clone(), Arc::new(sink));
        session.run().await;
        drain(&mut rx);

        peripheral.push(0x2A37, vec![0b0000_0110, 72]);
        let emission = loop {
            let e = rx.recv().await.unwrap();
            if e.target == HR_TARGET {
                break e;
            }
        };
        assert_eq!(emission.label, "Parsed data");
        assert_eq!(
            emission.payload,
            Some(json!({"bpm": 72, "sensor": "contact", "energyExpended": null, "rrInterval": null}))
        );
    }

    #[tokio::test]
    async fn test_unknown_characteristic_is_raw() {
        let peripheral = Arc::new(
            MockPeripheral::new("dev")
                .with_service(0xFFF0)
                .with_data_point(0xFFF0, 0xFFF1, &[Capability::Read])
                .with_value(0xFFF1, vec![0x68, 0x69]),
        );
        let (_, emissions) = run_session(&peripheral).await;

        let target = "peripheral[dev].services[fff0].characteristic[fff1]";
        assert!(find(&emissions, target, "Parsed data").is_none());
        let raw = find(&emissions, target, "Raw").unwrap();
        assert_eq!(
            raw.payload,
            Some(json!({"type": "Buffer", "data": "6869", "utf8": "hi"}))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_stops_session() {
        let peripheral = Arc::new(
            heart_rate_monitor().failing(Op::Connect, AdapterError::Connection("timeout".into())),
        );
        let (session, emissions) = run_session(&peripheral).await;

        assert!(session.state().is_terminal());
        assert_eq!(peripheral.calls(), vec![Op::Connect]);
        let failed = find(&emissions, "peripheral[hrm-1]", "Failed to connect").unwrap();
        assert_eq!(failed.payload, Some(json!("Connection error: timeout")));
        assert!(emissions.iter().all(|e| e.label != "Connected!"));
    }

    #[tokio::test]
    async fn test_service_discovery_failure() {
        let peripheral = Arc::new(
            heart_rate_monitor().failing(Op::DiscoverServices, AdapterError::Gatt("busy".into())),
        );
        let (session, emissions) = run_session(&peripheral).await;

        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert!(find(&emissions, "peripheral[hrm-1]", "Failed to discover services").is_some());
        assert_eq!(peripheral.calls(), vec![Op::Connect, Op::DiscoverServices]);
    }

    #[tokio::test]
    async fn test_failures_stay_on_their_branch() {
        let battery_service = uuid_from_u16(0x180F);
        let location = uuid_from_u16(0x2A38);
        let peripheral = Arc::new(
            heart_rate_monitor()
                .failing(
                    Op::DiscoverDataPoints(battery_service),
                    AdapterError::Gatt("no access".into()),
                )
                .failing(Op::Read(location), AdapterError::Gatt("auth".into())),
        );
        let (session, emissions) = run_session(&peripheral).await;

        assert_eq!(session.state(), &SessionState::Active);
        assert!(find(
            &emissions,
            "peripheral[hrm-1].services[180f]",
            "Failed to discover characteristics"
        )
        .is_some());
        assert!(find(
            &emissions,
            "peripheral[hrm-1].services[180d].characteristic[2a38]",
            "Failed to read value"
        )
        .is_some());
        // Heart rate measurement still subscribed
        assert!(find(&emissions, HR_TARGET, "Subscribed!").is_some());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_emitted() {
        let hr = uuid_from_u16(0x2A37);
        let peripheral = Arc::new(
            heart_rate_monitor().failing(Op::Subscribe(hr), AdapterError::Gatt("denied".into())),
        );
        let (_, emissions) = run_session(&peripheral).await;
        let failed = find(&emissions, HR_TARGET, "Failed to subscribe").unwrap();
        assert_eq!(failed.payload, Some(json!("GATT error: denied")));
        assert!(find(&emissions, HR_TARGET, "Subscribed!").is_none());
    }

    #[tokio::test]
    async fn test_read_payload_is_kept() {
        let peripheral = Arc::new(heart_rate_monitor());
        let (session, _) = run_session(&peripheral).await;
        let battery = session
            .services()
            .iter()
            .flat_map(|s| s.data_points.iter())
            .find(|dp| dp.short_id() == Some(0x2A19))
            .unwrap();
        assert_eq!(battery.last_payload.get(), Some(vec![0x5A]));
    }
}
