//! Scan Controller
//!
//! Waits for the radio to become ready, scans for peripherals advertising
//! known services and hands every observed peripheral to its own
//! [`DiscoverySession`]. Readiness changes are retried forever.

use crate::domain::models::{display_id, uuid_from_u16, AdapterState};
use crate::domain::registry;
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, AdapterEvent, BleAdapter, PeripheralLink,
};
use crate::infrastructure::bluetooth::session::{peripheral_target, DiscoverySession};
use crate::infrastructure::emit::{EmitSink, EmitSinkExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Registry services as scan filter UUIDs
pub fn known_services() -> Vec<Uuid> {
    registry::scan_filter()
        .into_iter()
        .map(uuid_from_u16)
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScanSummary {
    services: Vec<String>,
    allow_duplicates: bool,
}

pub struct ScanController {
    adapter: Arc<dyn BleAdapter>,
    sink: Arc<dyn EmitSink>,
    services: Vec<Uuid>,
    allow_duplicates: bool,
    target: String,
    scanning: bool,
}

impl ScanController {
    /// `services` empty scans for every peripheral
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        sink: Arc<dyn EmitSink>,
        services: Vec<Uuid>,
        allow_duplicates: bool,
    ) -> Self {
        let ids: Vec<String> = services.iter().map(display_id).collect();
        let target = format!("adapter[{}]", ids.join(","));
        Self {
            adapter,
            sink,
            services,
            allow_duplicates,
            target,
            scanning: false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Run until the adapter's event feed closes
    pub async fn run(mut self) -> Result<(), AdapterError> {
        let mut events = self.start().await?;
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("{}: adapter event feed closed", self.target);
        Ok(())
    }

    /// Subscribe to adapter events and try to start scanning
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        self.sink.emit_value(
            &self.target,
            "Initializing",
            &ScanSummary {
                services: self.services.iter().map(display_id).collect(),
                allow_duplicates: self.allow_duplicates,
            },
        );

        // Subscribe first so no readiness change slips between the check and the feed
        let events = self.adapter.events().await?;
        let state = self.adapter.state().await?;
        self.on_state(state).await;
        Ok(events)
    }

    /// React to one adapter event. Returns the spawned session, if any.
    pub async fn handle(&mut self, event: AdapterEvent) -> Option<JoinHandle<()>> {
        match event {
            AdapterEvent::StateChanged(state) => {
                self.sink
                    .emit_value(&self.target, "changed state", &state.to_string());
                self.on_state(state).await;
                None
            }
            AdapterEvent::PeripheralObserved(link) => Some(self.spawn_session(link)),
            AdapterEvent::PeripheralDisconnected(id) => {
                info!("peripheral {} disconnected", id);
                self.sink
                    .emit_label(&format!("peripheral[{}]", id), "Disconnected");
                None
            }
        }
    }

    async fn on_state(&mut self, state: AdapterState) {
        if !state.is_ready() {
            // The radio stops scanning when it leaves the ready state
            self.scanning = false;
            self.sink.emit_value(
                &self.target,
                "Adapter is not currently powered on",
                &state.to_string(),
            );
            return;
        }
        if self.scanning {
            return;
        }

        self.sink.emit_label(&self.target, "Starting scan...");
        match self
            .adapter
            .start_scanning(&self.services, self.allow_duplicates)
            .await
        {
            Ok(()) => {
                self.scanning = true;
                info!("{}: scanning", self.target);
                self.sink.emit_label(&self.target, "Now scanning!");
            }
            Err(e) => {
                warn!("{}: failed to start scan: {}", self.target, e);
                self.sink
                    .emit_value(&self.target, "Failed to start scan", &e.to_string());
            }
        }
    }

    fn spawn_session(&self, link: Arc<dyn PeripheralLink>) -> JoinHandle<()> {
        info!("Observed {}", peripheral_target(link.info()));
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let mut session = DiscoverySession::new(link, sink);
            session.run().await;
        })
    }
}
