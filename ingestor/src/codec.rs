//! Binary payload codec.
//!
//! Layout sent by the devices:
//!
//! ```text
//! byte 0    type
//! byte 1    power (battery percentage)
//! byte 2-3  reading, big endian (optional)
//! ```
//!
//! The LoRaWAN frame port is passed through every stage but this format does
//! not use it.

use crate::errors::{Error, Result};
use crate::model::{ClassifiedPayload, DecodedPayload, DisplayType, ValidatedReport};
use thiserror::Error as ThisError;
use tracing::debug;

const TYPE_MIN: i32 = 0;
const TYPE_MAX: i32 = 6;
const POWER_MIN: i32 = 1;
const POWER_MAX: i32 = 100;
const READING_TYPE: i32 = 1;

/// Inclusive range a reading must fall in. Set per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingBounds {
    pub min: i32,
    pub max: i32,
}

impl Default for ReadingBounds {
    fn default() -> Self {
        Self { min: 0, max: 5000 }
    }
}

impl ReadingBounds {
    pub fn contains(&self, reading: i32) -> bool {
        reading >= self.min && reading <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Rejection {
    #[error("type {0} out of range [0, 6]")]
    TypeOutOfRange(i32),

    #[error("power {0} out of range [1, 100]")]
    PowerOutOfRange(i32),

    #[error("reading type without a reading")]
    MissingReading,

    #[error("reading {reading} out of range [{min}, {max}]")]
    ReadingOutOfRange { reading: i32, min: i32, max: i32 },
}

impl Rejection {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TypeOutOfRange(_) => "type_out_of_range",
            Rejection::PowerOutOfRange(_) => "power_out_of_range",
            Rejection::MissingReading => "missing_reading",
            Rejection::ReadingOutOfRange { .. } => "reading_out_of_range",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted(ValidatedReport),
    Rejected(Rejection),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }

    pub fn into_result(self) -> std::result::Result<ValidatedReport, Rejection> {
        match self {
            Validation::Accepted(report) => Ok(report),
            Validation::Rejected(rejection) => Err(rejection),
        }
    }
}

pub fn decode(bytes: &[u8], _port: u16) -> Result<DecodedPayload> {
    let (payload_type, power) = match bytes {
        [payload_type, power, ..] => (*payload_type, *power),
        _ => {
            return Err(Error::Decode(format!(
                "payload needs at least 2 bytes, got {}",
                bytes.len()
            )))
        }
    };

    let reading = match bytes {
        [_, _, high, low, ..] => Some(i32::from(u16::from_be_bytes([*high, *low]))),
        [_, _, _] => {
            debug!("Ignoring dangling reading byte in 3 byte payload");
            None
        }
        _ => None,
    };

    Ok(DecodedPayload {
        payload_type: i32::from(payload_type),
        power: i32::from(power),
        reading,
    })
}

pub fn classify(decoded: DecodedPayload, _port: u16) -> ClassifiedPayload {
    ClassifiedPayload {
        payload_type: decoded.payload_type,
        power: decoded.power,
        reading: decoded.reading,
        display_type: DisplayType::from_type(decoded.payload_type),
    }
}

pub fn validate(classified: ClassifiedPayload, _port: u16, bounds: &ReadingBounds) -> Validation {
    if classified.payload_type < TYPE_MIN || classified.payload_type > TYPE_MAX {
        return Validation::Rejected(Rejection::TypeOutOfRange(classified.payload_type));
    }

    // A device cannot transmit on an empty battery
    if classified.power < POWER_MIN || classified.power > POWER_MAX {
        return Validation::Rejected(Rejection::PowerOutOfRange(classified.power));
    }

    if classified.payload_type == READING_TYPE && classified.reading.is_none() {
        return Validation::Rejected(Rejection::MissingReading);
    }

    if let Some(reading) = classified.reading {
        if !bounds.contains(reading) {
            return Validation::Rejected(Rejection::ReadingOutOfRange {
                reading,
                min: bounds.min,
                max: bounds.max,
            });
        }
    }

    Validation::Accepted(ValidatedReport::new(classified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(payload_type: i32, power: i32, reading: Option<i32>) -> ClassifiedPayload {
        ClassifiedPayload {
            payload_type,
            power,
            reading,
            display_type: DisplayType::from_type(payload_type),
        }
    }

    fn rejection(payload: ClassifiedPayload, bounds: &ReadingBounds) -> Rejection {
        match validate(payload, 0, bounds) {
            Validation::Rejected(rejection) => rejection,
            Validation::Accepted(report) => panic!("expected rejection, got {:?}", report),
        }
    }

    #[test]
    fn test_decode_full_payload() {
        let decoded = decode(&[0b0000_0001, 0b0000_1100, 0b0000_0001, 0b0000_0001], 0).unwrap();

        assert_eq!(decoded.payload_type, 1);
        assert_eq!(decoded.power, 12);
        assert_eq!(decoded.reading, Some(257));
    }

    #[test]
    fn test_decode_reading_is_big_endian() {
        let samples: [[u8; 4]; 4] = [[1, 1, 0, 0], [1, 1, 0, 200], [1, 1, 0x13, 0x88], [1, 1, 0xff, 0xff]];
        for bytes in samples {
            let decoded = decode(&bytes, 0).unwrap();
            let expected = (i32::from(bytes[2]) << 8) | i32::from(bytes[3]);
            assert_eq!(decoded.reading, Some(expected));
        }
    }

    #[test]
    fn test_decode_two_bytes_has_no_reading() {
        let decoded = decode(&[0, 80], 0).unwrap();

        assert_eq!(decoded.payload_type, 0);
        assert_eq!(decoded.power, 80);
        assert_eq!(decoded.reading, None);
    }

    #[test]
    fn test_decode_three_bytes_has_no_reading() {
        assert_eq!(decode(&[1, 80, 3], 0).unwrap().reading, None);
    }

    #[test]
    fn test_decode_extra_bytes_ignored() {
        assert_eq!(decode(&[1, 80, 0, 10, 99], 0).unwrap().reading, Some(10));
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(decode(&[], 0), Err(Error::Decode(_))));
        assert!(matches!(decode(&[1], 0), Err(Error::Decode(_))));
    }

    #[test]
    fn test_classify_known_types() {
        let expected = [
            (0, "Still Here"),
            (1, "Reading"),
            (2, "Error"),
            (3, "Microcontroller Error"),
            (4, "Sensor Error"),
            (5, "Battery Error"),
            (6, "Storage Error"),
        ];
        for (payload_type, display_type) in expected {
            let decoded = DecodedPayload {
                payload_type,
                power: 50,
                reading: None,
            };
            assert_eq!(classify(decoded, 0).display_type.as_str(), display_type);
        }
    }

    #[test]
    fn test_classify_unmapped_types_are_still_here() {
        for payload_type in [-1, 7, 42, 255, i32::MIN, i32::MAX] {
            let decoded = DecodedPayload {
                payload_type,
                power: 50,
                reading: None,
            };
            assert_eq!(classify(decoded, 0).display_type, DisplayType::StillHere);
        }
    }

    #[test]
    fn test_classify_keeps_decoded_fields() {
        let decoded = DecodedPayload {
            payload_type: 1,
            power: 30,
            reading: Some(400),
        };
        let classified = classify(decoded, 0);

        assert_eq!(classified.power, 30);
        assert_eq!(classified.reading, Some(400));
    }

    #[test]
    fn test_valid_reading() {
        let validation = validate(classified(1, 30, Some(400)), 0, &ReadingBounds::default());

        assert!(validation.is_accepted());
        let report = validation.into_result().unwrap();
        assert_eq!(report.reading(), Some(400));
        assert_eq!(report.display_type(), DisplayType::Reading);
    }

    #[test]
    fn test_valid_with_signed_bounds() {
        let bounds = ReadingBounds { min: -500, max: 500 };

        assert!(validate(classified(1, 30, Some(400)), 0, &bounds).is_accepted());
        assert!(validate(classified(1, 30, Some(-500)), 0, &bounds).is_accepted());
    }

    #[test]
    fn test_valid_heartbeat_and_error() {
        let bounds = ReadingBounds::default();

        assert!(validate(classified(0, 1, None), 0, &bounds).is_accepted());
        assert!(validate(classified(6, 100, None), 0, &bounds).is_accepted());
    }

    #[test]
    fn test_invalid_type() {
        let bounds = ReadingBounds::default();

        assert_eq!(rejection(classified(-1, 30, None), &bounds), Rejection::TypeOutOfRange(-1));
        assert_eq!(rejection(classified(7, 30, None), &bounds), Rejection::TypeOutOfRange(7));
    }

    #[test]
    fn test_invalid_power() {
        let bounds = ReadingBounds::default();

        assert_eq!(rejection(classified(0, 0, None), &bounds), Rejection::PowerOutOfRange(0));
        assert_eq!(rejection(classified(0, 101, None), &bounds), Rejection::PowerOutOfRange(101));
        assert_eq!(rejection(classified(1, 500, Some(-20)), &bounds), Rejection::PowerOutOfRange(500));
    }

    #[test]
    fn test_missing_reading() {
        assert_eq!(
            rejection(classified(1, 30, None), &ReadingBounds::default()),
            Rejection::MissingReading
        );
    }

    #[test]
    fn test_reading_out_of_range() {
        let bounds = ReadingBounds::default();

        assert_eq!(
            rejection(classified(1, 30, Some(5001)), &bounds),
            Rejection::ReadingOutOfRange {
                reading: 5001,
                min: 0,
                max: 5000
            }
        );
        assert_eq!(rejection(classified(1, 30, Some(-20)), &bounds).reason(), "reading_out_of_range");
        assert!(!validate(classified(1, 30, Some(501)), 0, &ReadingBounds { min: -500, max: 500 }).is_accepted());
    }

    #[test]
    fn test_reading_checked_on_non_reading_types() {
        let validation = validate(classified(0, 30, Some(9000)), 0, &ReadingBounds::default());

        assert!(!validation.is_accepted());
    }

    #[test]
    fn test_decode_classify_validate_pipeline() {
        let decoded = decode(&[1, 50, 0, 200], 1).unwrap();
        let classified = classify(decoded, 1);
        let report = validate(classified, 1, &ReadingBounds::default())
            .into_result()
            .unwrap();

        assert_eq!(report.payload_type(), 1);
        assert_eq!(report.power(), 50);
        assert_eq!(report.reading(), Some(200));
        assert_eq!(report.display_type(), DisplayType::Reading);
    }
}
