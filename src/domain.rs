//! ==============================================================================
//! domain.rs - readings, payloads and unit helpers
//! ==============================================================================
//!
//! purpose:
//!     the small data model shared by the sensor tasks and the uplink.
//!     a Reading is what came off a channel, a Payload is what goes on the wire.
//!
//! relationships:
//!     - produced by: runtime.rs (polling tasks)
//!     - consumed by: uplink.rs (builds Payload from Reading)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// the four sensor types on the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Lux,
    Humidity,
    Voltage,
}

impl SensorKind {
    /// polling order used at startup
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Temperature,
        SensorKind::Lux,
        SensorKind::Humidity,
        SensorKind::Voltage,
    ];

    /// name used in the `sensor_type` payload field
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Lux => "lux",
            SensorKind::Humidity => "humidity",
            SensorKind::Voltage => "voltage",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// one value read from a channel, in the SDK's native unit
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    /// celsius, lux, percent RH or voltage ratio
    pub value: f64,
    pub sensor_id: String,
    /// reading timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl Reading {
    pub fn now(kind: SensorKind, value: f64, sensor_id: impl Into<String>) -> Self {
        Self {
            kind,
            value,
            sensor_id: sensor_id.into(),
            timestamp_ms: timestamp_ms(),
        }
    }

    /// value as reported upstream (temperature goes out in fahrenheit)
    pub fn measurement(&self) -> f64 {
        match self.kind {
            SensorKind::Temperature => celsius_to_fahrenheit(self.value),
            _ => self.value,
        }
    }

    /// human readable line for the log
    pub fn describe(&self) -> String {
        match self.kind {
            SensorKind::Temperature => {
                format!("Temperature is {} degrees Fahrenheit", self.measurement())
            }
            SensorKind::Lux => format!("Illuminance is {} lux", self.value),
            SensorKind::Humidity => format!("Humidity is {}%", self.value),
            SensorKind::Voltage => match SoilMoisture::classify(self.value) {
                Some(level) => format!("Voltage of soil is {} - indicating {}", self.value, level),
                None => format!("Voltage of soil is {} - unmeasured", self.value),
            },
        }
    }
}

/// flat json body posted to the endpoint
///
/// field order matters to people reading the server logs, keep it stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub measurement: f64,
    pub user_id: String,
    pub user_plant_id: String,
    pub sensor_type: String,
    pub sensor_id: String,
}

impl Payload {
    pub fn new(
        measurement: f64,
        user_id: &str,
        user_plant_id: &str,
        kind: SensorKind,
        sensor_id: &str,
    ) -> Self {
        Self {
            measurement,
            user_id: user_id.to_string(),
            user_plant_id: user_plant_id.to_string(),
            sensor_type: kind.as_str().to_string(),
            sensor_id: sensor_id.to_string(),
        }
    }

    pub fn from_reading(reading: &Reading, user_id: &str, user_plant_id: &str) -> Self {
        Self::new(
            reading.measurement(),
            user_id,
            user_plant_id,
            reading.kind,
            &reading.sensor_id,
        )
    }
}

/// soil state derived from the soil moisture sensor's voltage ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoilMoisture {
    Dry,
    Moist,
    Flooded,
}

impl SoilMoisture {
    /// (0, 0.2] dry, (0.2, 0.5] moist, (0.5, 1.0] flooded, anything else is
    /// outside what the sensor can report.
    pub fn classify(ratio: f64) -> Option<Self> {
        if ratio > 0.0 && ratio <= 0.2 {
            Some(SoilMoisture::Dry)
        } else if ratio > 0.2 && ratio <= 0.5 {
            Some(SoilMoisture::Moist)
        } else if ratio > 0.5 && ratio <= 1.0 {
            Some(SoilMoisture::Flooded)
        } else {
            None
        }
    }
}

impl fmt::Display for SoilMoisture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SoilMoisture::Dry => "dry soil",
            SoilMoisture::Moist => "moist soil",
            SoilMoisture::Flooded => "flooded soil",
        };
        f.write_str(label)
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// get current timestamp in milliseconds (unix epoch)
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
