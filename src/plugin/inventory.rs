use std::fmt;

use crate::config::CONTAINER_PATH_PREFIX;
use crate::deviceplugin::v1beta1::Device;

/// Prefix of every advertised device identifier.
pub const DEVICE_ID_PREFIX: &str = "vcan";

/// Device health as understood by the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed pool of advertised devices.
///
/// Generated once at plugin start; identifiers stay stable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Inventory {
    devices: Vec<Device>,
}

impl Inventory {
    /// Generates `size` healthy devices with identifiers of the form `vcan-<uuid>`.
    pub fn generate(size: usize) -> Self {
        let devices = (0..size)
            .map(|_| Device {
                id: format!("{DEVICE_ID_PREFIX}-{}", uuid::Uuid::new_v4()),
                health: Health::Healthy.as_str().to_owned(),
                topology: None,
            })
            .collect();

        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Path under which the device `device_id` appears inside the container.
pub fn device_container_path(device_id: &str) -> String {
    format!("{CONTAINER_PATH_PREFIX}/{device_id}")
}
