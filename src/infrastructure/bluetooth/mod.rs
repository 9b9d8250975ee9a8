//! Bluetooth Module
//!
//! Scans for peripherals exposing known GATT services, connects to each one
//! and reports every characteristic it can read or subscribe to.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ScanController                        │
//! │  (waits for the radio, scans, spawns one session each)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐
//! │  Adapter  │  │  Session   │  │   Backend    │
//! │           │  │            │  │              │
//! │ - traits  │  │ - connect  │  │ - btleplug   │
//! │ - events  │  │ - discover │  │   host stack │
//! │ - errors  │  │ - read/sub │  │              │
//! └───────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Radio traits, events and errors
//! - [`scanner`] - Readiness handling and scanning
//! - [`session`] - Per-peripheral discovery state machine
//! - `btleplug_backend` - Host radio backend (feature `btleplug`)

pub mod adapter;
#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
#[cfg(test)]
pub(crate) mod mock;
pub mod scanner;
pub mod session;

pub use adapter::{AdapterError, AdapterEvent, BleAdapter, PeripheralLink};
pub use scanner::ScanController;
pub use session::DiscoverySession;
