use std::collections::HashSet;

/// Source of the devices allowed to submit data.
pub trait DeviceRegistry: Send + Sync {
    fn is_authorized(&self, device_id: &str) -> bool;
}

/// Fixed set of device ids loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    devices: HashSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for Allowlist {
    fn is_authorized(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }
}
