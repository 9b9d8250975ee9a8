//! Adapter Interface
//!
//! The radio stack as seen by the scan controller and discovery sessions.
//! Backends (the btleplug host stack, the test simulator) implement these
//! traits; nothing above this layer touches a platform API.

use crate::domain::models::{
    AdapterState, DataPointInstance, PeripheralInfo, ServiceInstance,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("No Bluetooth adapter available")]
    Unavailable,

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Peer disconnected")]
    Disconnected,
}

/// Events pushed by the adapter
#[derive(Clone)]
pub enum AdapterEvent {
    /// Radio readiness changed
    StateChanged(AdapterState),
    /// A new peripheral matched the scan
    PeripheralObserved(Arc<dyn PeripheralLink>),
    /// The link to a peripheral went away
    PeripheralDisconnected(String),
}

impl std::fmt::Debug for AdapterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::PeripheralObserved(link) => f
                .debug_tuple("PeripheralObserved")
                .field(&link.info().id)
                .finish(),
            Self::PeripheralDisconnected(id) => {
                f.debug_tuple("PeripheralDisconnected").field(id).finish()
            }
        }
    }
}

/// Central role: radio state, scanning and the event feed
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current radio readiness
    async fn state(&self) -> Result<AdapterState, AdapterError>;

    /// Subscribe to adapter events. Each call returns an independent feed.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError>;

    /// Start scanning for peripherals advertising any of `services`
    /// (all peripherals when empty)
    async fn start_scanning(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError>;
}

/// GATT client operations against one observed peripheral
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    fn info(&self) -> &PeripheralInfo;

    async fn connect(&self) -> Result<(), AdapterError>;

    /// Discover services; an empty filter discovers everything
    async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<ServiceInstance>, AdapterError>;

    /// Discover the characteristics of one service; an empty filter discovers everything
    async fn discover_data_points(
        &self,
        service: &ServiceInstance,
        filter: &[Uuid],
    ) -> Result<Vec<DataPointInstance>, AdapterError>;

    async fn read(&self, data_point: &DataPointInstance) -> Result<Vec<u8>, AdapterError>;

    /// Attach a listener for value pushes of one characteristic. The feed stays
    /// open until the link goes away.
    async fn listen(
        &self,
        data_point: &DataPointInstance,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError>;

    /// Ask the peripheral to start pushing values
    async fn subscribe(&self, data_point: &DataPointInstance) -> Result<(), AdapterError>;
}
