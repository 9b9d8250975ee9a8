//! Bluetooth LE GATT scout
//!
//! Finds peripherals advertising standard services (Device Information,
//! Battery, Heart Rate), enumerates their characteristics and prints each
//! value decoded through a static registry.

pub mod domain;
pub mod infrastructure;
