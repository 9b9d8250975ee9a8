//! GATT Registry
//!
//! Static tables of the services and characteristics this tool knows how to
//! name and decode. Identifiers are the assigned 16-bit Bluetooth numbers.

use crate::domain::decoder::DecodeRule;

/// A known GATT service and the characteristics it groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub identifier: u16,
    pub name: &'static str,
    pub type_tag: &'static str,
    pub mandatory_data_points: &'static [u16],
    pub optional_data_points: &'static [u16],
    pub conditional_data_points: &'static [u16],
}

/// A known characteristic and the rule used to decode its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPointDefinition {
    pub identifier: u16,
    pub name: &'static str,
    pub type_tag: &'static str,
    pub decode: DecodeRule,
}

/// Assigned service numbers
pub mod service_ids {
    pub const DEVICE_INFORMATION: u16 = 0x180A;
    pub const BATTERY: u16 = 0x180F;
    pub const HEART_RATE: u16 = 0x180D;
}

/// Assigned characteristic numbers
pub mod data_point_ids {
    pub const MANUFACTURER_NAME: u16 = 0x2A29;
    pub const MODEL_NUMBER: u16 = 0x2A24;
    pub const SERIAL_NUMBER: u16 = 0x2A25;
    pub const HARDWARE_REVISION: u16 = 0x2A27;
    pub const FIRMWARE_REVISION: u16 = 0x2A26;
    pub const SOFTWARE_REVISION: u16 = 0x2A28;
    pub const SYSTEM_ID: u16 = 0x2A23;
    pub const BATTERY_LEVEL: u16 = 0x2A19;
    pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
    pub const BODY_SENSOR_LOCATION: u16 = 0x2A38;
    pub const HEART_RATE_CONTROL_POINT: u16 = 0x2A39;
}

use data_point_ids::*;
use service_ids::*;

static SERVICES: &[ServiceDefinition] = &[
    ServiceDefinition {
        identifier: DEVICE_INFORMATION,
        name: "Device Information",
        type_tag: "org.bluetooth.service.device_information",
        mandatory_data_points: &[],
        // Regulatory certification list (0x2A2A) and PnP ID (0x2A50) are not decoded
        optional_data_points: &[
            MANUFACTURER_NAME,
            MODEL_NUMBER,
            SERIAL_NUMBER,
            HARDWARE_REVISION,
            FIRMWARE_REVISION,
            SOFTWARE_REVISION,
        ],
        conditional_data_points: &[],
    },
    ServiceDefinition {
        identifier: BATTERY,
        name: "Battery Service",
        type_tag: "org.bluetooth.service.battery_service",
        mandatory_data_points: &[BATTERY_LEVEL],
        optional_data_points: &[],
        conditional_data_points: &[],
    },
    ServiceDefinition {
        identifier: HEART_RATE,
        name: "Heart Rate",
        type_tag: "org.bluetooth.service.heart_rate",
        mandatory_data_points: &[HEART_RATE_MEASUREMENT],
        optional_data_points: &[BODY_SENSOR_LOCATION],
        // Mandatory only when the Energy Expended feature is supported
        conditional_data_points: &[HEART_RATE_CONTROL_POINT],
    },
];

static DATA_POINTS: &[DataPointDefinition] = &[
    // Device Information (0x180A)
    DataPointDefinition {
        identifier: MANUFACTURER_NAME,
        name: "Manufacturer Name String",
        type_tag: "org.bluetooth.characteristic.manufacturer_name_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: MODEL_NUMBER,
        name: "Model Number String",
        type_tag: "org.bluetooth.characteristic.model_number_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: SERIAL_NUMBER,
        name: "Serial Number String",
        type_tag: "org.bluetooth.characteristic.serial_number_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: HARDWARE_REVISION,
        name: "Hardware Revision String",
        type_tag: "org.bluetooth.characteristic.hardware_revision_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: FIRMWARE_REVISION,
        name: "Firmware Revision String",
        type_tag: "org.bluetooth.characteristic.firmware_revision_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: SOFTWARE_REVISION,
        name: "Software Revision String",
        type_tag: "org.bluetooth.characteristic.software_revision_string",
        decode: DecodeRule::Utf8Text,
    },
    DataPointDefinition {
        identifier: SYSTEM_ID,
        name: "System ID",
        type_tag: "org.bluetooth.characteristic.system_id",
        decode: DecodeRule::SystemId,
    },
    // Battery Service (0x180F)
    DataPointDefinition {
        identifier: BATTERY_LEVEL,
        name: "Battery Level",
        type_tag: "org.bluetooth.characteristic.battery_level",
        decode: DecodeRule::BatteryLevel,
    },
    // Heart Rate (0x180D)
    DataPointDefinition {
        identifier: HEART_RATE_MEASUREMENT,
        name: "Heart Rate Measurement",
        type_tag: "org.bluetooth.characteristic.heart_rate_measurement",
        decode: DecodeRule::HeartRateMeasurement,
    },
    DataPointDefinition {
        identifier: BODY_SENSOR_LOCATION,
        name: "Body Sensor Location",
        type_tag: "org.bluetooth.characteristic.body_sensor_location",
        decode: DecodeRule::BodySensorLocation,
    },
    DataPointDefinition {
        identifier: HEART_RATE_CONTROL_POINT,
        name: "Heart Rate Control Point",
        type_tag: "org.bluetooth.characteristic.heart_rate_control_point",
        decode: DecodeRule::HeartRateControlPoint,
    },
];

/// All known service definitions, in table order
pub fn services() -> &'static [ServiceDefinition] {
    SERVICES
}

/// Find a service definition by its exact 16-bit identifier
pub fn lookup_service(identifier: u16) -> Option<&'static ServiceDefinition> {
    SERVICES.iter().find(|s| s.identifier == identifier)
}

/// Find a characteristic definition by its exact 16-bit identifier
pub fn lookup(identifier: u16) -> Option<&'static DataPointDefinition> {
    DATA_POINTS.iter().find(|d| d.identifier == identifier)
}

/// All known characteristic definitions, in table order
pub fn data_points() -> &'static [DataPointDefinition] {
    DATA_POINTS
}

/// Service identifiers to restrict scanning to
pub fn scan_filter() -> Vec<u16> {
    SERVICES.iter().map(|s| s.identifier).collect()
}
