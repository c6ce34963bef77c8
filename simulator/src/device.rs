use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};

const STILL_HERE: u8 = 0;
const READING: u8 = 1;
const ERROR_TYPES: std::ops::RangeInclusive<u8> = 2..=6;

/// Uplink in the shape the network server publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkMessage {
    pub app_id: String,
    pub dev_id: String,
    pub port: u16,
    pub counter: u32,
    pub payload_raw: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Simulated sensor whose reading drifts a little on every uplink.
#[derive(Debug, Clone)]
pub struct Device {
    pub dev_id: String,
    reading: u16,
    power: u8,
    counter: u32,
    min: u16,
    max: u16,
}

impl Device {
    pub fn new(rng: &mut impl Rng, dev_id: String, min: u16, max: u16) -> Self {
        Self {
            dev_id,
            reading: rng.gen_range(min..=max),
            power: rng.gen_range(80..=100),
            counter: 0,
            min,
            max,
        }
    }

    /// Advance the device one step and return the bytes it would send.
    pub fn next_payload(&mut self, rng: &mut impl Rng, error_rate: f64) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        self.power = next_power(rng, self.power);

        if rng.gen_bool(error_rate) {
            return vec![rng.gen_range(ERROR_TYPES), self.power];
        }

        let step_down: i32 = if self.reading <= self.min { 0 } else { -10 };
        let step_up: i32 = if self.reading >= self.max { 0 } else { 10 };
        let next = (i32::from(self.reading) + rng.gen_range(step_down..=step_up))
            .clamp(i32::from(self.min), i32::from(self.max)) as u16;

        if next == self.reading {
            return vec![STILL_HERE, self.power];
        }

        self.reading = next;
        let [high, low] = next.to_be_bytes();
        vec![READING, self.power, high, low]
    }

    pub fn uplink(&mut self, rng: &mut impl Rng, app_id: &str, error_rate: f64) -> UplinkMessage {
        let payload = self.next_payload(rng, error_rate);
        UplinkMessage {
            app_id: app_id.to_string(),
            dev_id: self.dev_id.clone(),
            port: 1,
            counter: self.counter,
            payload_raw: STANDARD.encode(payload),
            metadata: Metadata {
                time: chrono::Utc::now(),
            },
        }
    }
}

fn next_power(rng: &mut impl Rng, power: u8) -> u8 {
    // Battery swapped or recharged
    if power < 2 || (power < 20 && rng.gen_bool(0.5)) {
        return rng.gen_range(80..=100);
    }
    power.saturating_sub(rng.gen_range(0..=5)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_payloads_stay_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = Device::new(&mut rng, "dev-0".to_string(), 0, 5000);

        for _ in 0..10_000 {
            let payload = device.next_payload(&mut rng, 0.01);
            let (payload_type, power) = (payload[0], payload[1]);

            assert!((1..=100).contains(&power));
            match payload_type {
                READING => {
                    assert_eq!(payload.len(), 4);
                    let reading = u16::from_be_bytes([payload[2], payload[3]]);
                    assert!(reading <= 5000);
                }
                STILL_HERE => assert_eq!(payload.len(), 2),
                t => {
                    assert!(ERROR_TYPES.contains(&t));
                    assert_eq!(payload.len(), 2);
                }
            }
        }
    }

    #[test]
    fn test_reading_pinned_to_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut device = Device::new(&mut rng, "dev-0".to_string(), 100, 100);

        for _ in 0..100 {
            assert_eq!(device.next_payload(&mut rng, 0.0)[0], STILL_HERE);
        }
    }

    #[test]
    fn test_uplink_encodes_payload() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut device = Device::new(&mut rng, "dev-9".to_string(), 0, 5000);

        let uplink = device.uplink(&mut rng, "sensors", 0.0);
        let bytes = STANDARD.decode(uplink.payload_raw).unwrap();

        assert_eq!(uplink.dev_id, "dev-9");
        assert_eq!(uplink.counter, 1);
        assert!(bytes.len() == 2 || bytes.len() == 4);
    }
}
