//! Characteristic value decoding
//!
//! Turns raw characteristic payloads into structured readings using the
//! rules attached to each registry entry. Decoding never fails with an
//! `Err`: malformed or out-of-range payloads become [`DecodedValue::Invalid`].

use crate::domain::registry::{self, DataPointDefinition};
use serde::Serialize;
use tracing::debug;

/// Decoding strategy attached to a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeRule {
    /// Whole payload as UTF-8 text, invalid sequences replaced
    Utf8Text,
    /// 40-bit manufacturer identifier + 24-bit OUI
    SystemId,
    /// Single unsigned byte, percent
    BatteryLevel,
    /// Flags-driven variable layout
    HeartRateMeasurement,
    /// Single byte enumeration
    BodySensorLocation,
    /// Single byte enumeration
    HeartRateControlPoint,
}

impl DecodeRule {
    /// Apply this rule to a payload
    pub fn apply(&self, data: &[u8]) -> DecodedValue {
        match self {
            Self::Utf8Text => DecodedValue::Text(String::from_utf8_lossy(data).into_owned()),
            Self::SystemId => decode_system_id(data),
            Self::BatteryLevel => decode_battery_level(data),
            Self::HeartRateMeasurement => decode_heart_rate_measurement(data),
            Self::BodySensorLocation => decode_body_sensor_location(data),
            Self::HeartRateControlPoint => decode_heart_rate_control_point(data),
        }
    }
}

/// A structured characteristic value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Text(String),
    Integer(u64),
    Label(&'static str),
    SystemId(SystemId),
    HeartRate(HeartRateMeasurement),
    Invalid(DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemId {
    pub manufacturer: u64,
    pub oui: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub sensor: SensorContact,
    /// kJ, `None` when the field is absent
    pub energy_expended: Option<u16>,
    /// 1/1024 s, `None` when the field is absent
    pub rr_interval: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorContact {
    #[serde(rename = "N/A")]
    NotAvailable,
    #[serde(rename = "no contact")]
    NoContact,
    #[serde(rename = "contact")]
    Contact,
}

/// A payload the rule could not make sense of
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeError {
    pub error: String,
    /// The offending byte(s)
    pub bytes: Vec<u8>,
}

impl DecodedValue {
    fn invalid(error: String, bytes: &[u8]) -> Self {
        Self::Invalid(DecodeError {
            error,
            bytes: bytes.to_vec(),
        })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Result of dispatching a payload through the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// A registry entry matched and its rule was applied
    Parsed {
        definition: &'static DataPointDefinition,
        value: DecodedValue,
    },
    /// No registry entry; the payload is handed on untouched
    Raw(Vec<u8>),
}

/// Decode a payload for the characteristic with the given 16-bit identifier
pub fn decode(identifier: u16, payload: &[u8]) -> Reading {
    match registry::lookup(identifier) {
        Some(definition) => Reading::Parsed {
            definition,
            value: definition.decode.apply(payload),
        },
        None => Reading::Raw(payload.to_vec()),
    }
}

/// Reads little-endian fields front to back
struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Read `width` bytes (at most 8) as an unsigned little-endian integer
    fn read_le(&mut self, width: usize) -> Result<u64, String> {
        let end = self.offset + width;
        let bytes = self.data.get(self.offset..end).ok_or_else(|| {
            format!(
                "needed {} byte(s) at offset {}, payload has {}",
                width,
                self.offset,
                self.data.len()
            )
        })?;
        self.offset = end;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn read_optional_le(&mut self, present: bool, width: usize) -> Result<Option<u64>, String> {
        if present {
            self.read_le(width).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn first_byte(name: &str, data: &[u8]) -> Result<u8, DecodedValue> {
    data.first().copied().ok_or_else(|| {
        DecodedValue::invalid(format!("Empty '{}' payload", name), data)
    })
}

fn decode_system_id(data: &[u8]) -> DecodedValue {
    if data.len() < 8 {
        return DecodedValue::invalid(
            format!("'System ID' needs 8 bytes, payload has {}", data.len()),
            data,
        );
    }
    let manufacturer = read_be(&data[0..5]);
    let oui = read_be(&data[5..8]) as u32;
    if manufacturer & 0xFFFF == 0xFFFE {
        // The 0xFFFE-suffixed form is not specialized yet; report it unchanged
        debug!("System ID manufacturer {:#012X} carries the 0xFFFE suffix", manufacturer);
    }
    DecodedValue::SystemId(SystemId { manufacturer, oui })
}

fn decode_battery_level(data: &[u8]) -> DecodedValue {
    // 101-255 are reserved but passed through as-is
    match first_byte("Battery Level", data) {
        Ok(level) => DecodedValue::Integer(u64::from(level)),
        Err(invalid) => invalid,
    }
}

/// Flags byte layout:
///
/// ```text
/// bit 0    : heart rate value format (0 = u8, 1 = u16)
/// bits 1-2 : sensor contact (2 = not detected, 3 = detected, else unsupported)
/// bit 3    : energy expended field present (u16, kJ)
/// bit 4    : RR-interval field present (u16, 1/1024 s)
/// bits 5-7 : reserved
/// ```
fn decode_heart_rate_measurement(data: &[u8]) -> DecodedValue {
    match read_heart_rate_measurement(&mut ByteCursor::new(data)) {
        Ok(measurement) => DecodedValue::HeartRate(measurement),
        Err(e) => DecodedValue::invalid(format!("Truncated 'Heart Rate Measurement': {}", e), data),
    }
}

fn read_heart_rate_measurement(cursor: &mut ByteCursor<'_>) -> Result<HeartRateMeasurement, String> {
    let flags = cursor.read_le(1)? as u8;
    let wide_value = flags & 0b0000_0001 != 0;
    let contact = (flags >> 1) & 0b11;
    let energy_present = (flags >> 3) & 0b1 == 1;
    let rr_present = (flags >> 4) & 0b1 == 1;

    let bpm = cursor.read_le(if wide_value { 2 } else { 1 })? as u16;
    let sensor = match contact {
        2 => SensorContact::NoContact,
        3 => SensorContact::Contact,
        _ => SensorContact::NotAvailable,
    };
    let energy_expended = cursor.read_optional_le(energy_present, 2)?.map(|v| v as u16);
    let rr_interval = cursor.read_optional_le(rr_present, 2)?.map(|v| v as u16);

    Ok(HeartRateMeasurement {
        bpm,
        sensor,
        energy_expended,
        rr_interval,
    })
}

const BODY_SENSOR_LOCATIONS: [&str; 7] = [
    "Other", "Chest", "Wrist", "Finger", "Hand", "Ear Lobe", "Foot",
];

fn decode_body_sensor_location(data: &[u8]) -> DecodedValue {
    let key = match first_byte("Body Sensor Location", data) {
        Ok(key) => key,
        Err(invalid) => return invalid,
    };
    match BODY_SENSOR_LOCATIONS.get(usize::from(key)).copied() {
        Some(label) => DecodedValue::Label(label),
        None => DecodedValue::invalid(
            format!("Invalid/unrecognized 'Body Sensor Location' value: {}", key),
            &[key],
        ),
    }
}

fn decode_heart_rate_control_point(data: &[u8]) -> DecodedValue {
    // Write-only on real devices; decoded for completeness
    match first_byte("Heart Rate Control Point", data) {
        Ok(0) => DecodedValue::Label("Reset Energy Expended"),
        Ok(key) => DecodedValue::invalid(
            format!("Invalid/unrecognized 'Heart Rate Control Point' value: {}", key),
            &[key],
        ),
        Err(invalid) => invalid,
    }
}
