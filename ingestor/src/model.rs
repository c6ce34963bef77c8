use crate::errors::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Uplink as delivered by the network server over MQTT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkMessage {
    #[serde(default)]
    pub app_id: String,
    pub dev_id: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub counter: u32,
    /// Base64 encoded device payload
    pub payload_raw: Option<String>,
}

impl UplinkMessage {
    pub fn into_raw(self) -> Result<RawUplink> {
        let encoded = self
            .payload_raw
            .ok_or_else(|| Error::Decode(format!("uplink from {} has no payload_raw", self.dev_id)))?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| Error::Decode(format!("payload_raw is not valid base64: {}", e)))?;

        Ok(RawUplink {
            device_id: self.dev_id,
            bytes,
            port: self.port,
        })
    }
}

/// Binary uplink ready for the codec. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUplink {
    pub device_id: String,
    pub bytes: Vec<u8>,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPayload {
    pub payload_type: i32,
    pub power: i32,
    pub reading: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayType {
    StillHere,
    Reading,
    Error,
    MicrocontrollerError,
    SensorError,
    BatteryError,
    StorageError,
}

/// Handling path an uplink takes through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Reading,
    Error,
    Heartbeat,
}

impl DisplayType {
    pub fn from_type(payload_type: i32) -> Self {
        match payload_type {
            1 => DisplayType::Reading,
            2 => DisplayType::Error,
            3 => DisplayType::MicrocontrollerError,
            4 => DisplayType::SensorError,
            5 => DisplayType::BatteryError,
            6 => DisplayType::StorageError,
            _ => DisplayType::StillHere,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayType::StillHere => "Still Here",
            DisplayType::Reading => "Reading",
            DisplayType::Error => "Error",
            DisplayType::MicrocontrollerError => "Microcontroller Error",
            DisplayType::SensorError => "Sensor Error",
            DisplayType::BatteryError => "Battery Error",
            DisplayType::StorageError => "Storage Error",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            DisplayType::Reading => Category::Reading,
            DisplayType::Error
            | DisplayType::MicrocontrollerError
            | DisplayType::SensorError
            | DisplayType::BatteryError
            | DisplayType::StorageError => Category::Error,
            DisplayType::StillHere => Category::Heartbeat,
        }
    }
}

impl fmt::Display for DisplayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedPayload {
    pub payload_type: i32,
    pub power: i32,
    pub reading: Option<i32>,
    pub display_type: DisplayType,
}

/// A classified payload that passed validation. Only `codec::validate` builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedReport(ClassifiedPayload);

impl ValidatedReport {
    pub(crate) fn new(payload: ClassifiedPayload) -> Self {
        Self(payload)
    }

    pub fn payload_type(&self) -> i32 {
        self.0.payload_type
    }

    pub fn power(&self) -> i32 {
        self.0.power
    }

    pub fn reading(&self) -> Option<i32> {
        self.0.reading
    }

    pub fn display_type(&self) -> DisplayType {
        self.0.display_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Readings,
    Errors,
    StillHeres,
}

impl Measurement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::Readings => "readings",
            Measurement::Errors => "errors",
            Measurement::StillHeres => "still_heres",
        }
    }

    pub fn has_field(&self, field: Field) -> bool {
        match self {
            Measurement::Readings => true,
            Measurement::Errors | Measurement::StillHeres => field == Field::Power,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Reading,
    Power,
    PrevDifferenceVal,
    PrevDifferencePct,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Reading => "reading",
            Field::Power => "power",
            Field::PrevDifferenceVal => "prev_difference_val",
            Field::PrevDifferencePct => "prev_difference_pct",
        }
    }
}

/// Previous reading minus current reading.
///
/// `pct` carries the same number as `val`; it is not a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difference {
    pub val: i64,
    pub pct: i64,
}

impl Difference {
    /// `None` when the previous value is so far out of range that the
    /// subtraction overflows.
    pub fn between(previous: i64, current: i64) -> Option<Self> {
        let val = previous.checked_sub(current)?;
        Some(Self { val, pct: val })
    }

    pub fn zero() -> Self {
        Self { val: 0, pct: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    pub device: String,
    pub payload_type: i32,
    pub display_type: DisplayType,
}

/// Field set of a point. Each variant fixes the fields its measurement may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fields {
    Reading {
        reading: i64,
        power: i64,
        difference: Option<Difference>,
    },
    Error {
        power: i64,
    },
    StillHere {
        power: i64,
    },
}

impl Fields {
    pub fn measurement(&self) -> Measurement {
        match self {
            Fields::Reading { .. } => Measurement::Readings,
            Fields::Error { .. } => Measurement::Errors,
            Fields::StillHere { .. } => Measurement::StillHeres,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Point stamped with the ingestion time.
    pub fn now(tags: Tags, fields: Fields) -> Self {
        Self {
            tags,
            fields,
            timestamp: Utc::now(),
        }
    }

    pub fn measurement(&self) -> Measurement {
        self.fields.measurement()
    }

    pub fn tag_map(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("device", self.tags.device.clone()),
            ("type", self.tags.payload_type.to_string()),
            ("display_type", self.tags.display_type.to_string()),
        ])
    }

    pub fn field_map(&self) -> BTreeMap<&'static str, i64> {
        let mut fields = BTreeMap::new();
        match self.fields {
            Fields::Reading {
                reading,
                power,
                difference,
            } => {
                fields.insert(Field::Reading.as_str(), reading);
                fields.insert(Field::Power.as_str(), power);
                if let Some(diff) = difference {
                    fields.insert(Field::PrevDifferenceVal.as_str(), diff.val);
                    fields.insert(Field::PrevDifferencePct.as_str(), diff.pct);
                }
            }
            Fields::Error { power } | Fields::StillHere { power } => {
                fields.insert(Field::Power.as_str(), power);
            }
        }
        fields
    }
}
