// src/io/mod.rs
//
// Device layer: the serial link seams, the shared device handle, the real
// `serialport` driver and the in-memory mock used by tests and demo mode.

mod device;
mod error;
pub mod mock;
pub mod serial;
pub mod traits;

use serde::{Deserialize, Serialize};

pub use device::DeviceHandle;
pub use error::SessionError;
pub use mock::MockBackend;
pub use serial::SystemPorts;
pub use traits::{PortBackend, SerialLink};

/// One enumerated serial device, as listed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub device: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(device: &str, description: &str) -> Self {
        Self {
            device: device.to_string(),
            description: description.to_string(),
        }
    }
}
