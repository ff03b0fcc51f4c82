// src/io/serial/mod.rs
//
// Serial port driver on top of the `serialport` crate.
// Enumerates real devices and opens them with the configured line settings.

pub mod framer;
pub mod reader;
pub mod utils;

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};

use super::traits::{PortBackend, SerialLink};
use super::PortInfo;
use utils::{to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits, LineSettings};

pub use framer::LineFramer;
pub use reader::{ReadLoop, ReadLoopOptions, StopSignal};
pub use utils::Parity;

/// Driver-level read timeout. Reads only happen once input is pending, so
/// this merely bounds a misbehaving driver.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Port Enumeration
// ============================================================================

/// Human-readable description for an enumerated port.
fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => info
            .product
            .clone()
            .or_else(|| info.manufacturer.clone())
            .unwrap_or_else(|| "USB Serial Device".to_string()),
        SerialPortType::BluetoothPort => "Bluetooth Serial Port".to_string(),
        SerialPortType::PciPort => "PCI Serial Port".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

/// List available serial ports.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The tty devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> io::Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;

    let ports: Vec<PortInfo> = ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            device: p.port_name,
        })
        .collect();

    if ports.is_empty() {
        tlog!("[serial] No serial ports found (check that the user may access serial devices, e.g. the dialout group)");
    }

    Ok(ports)
}

// ============================================================================
// System Backend
// ============================================================================

/// Backend for the machine's real serial devices.
#[derive(Clone, Debug)]
pub struct SystemPorts {
    line: LineSettings,
    read_timeout: Duration,
}

impl SystemPorts {
    pub fn new(line: LineSettings) -> Self {
        Self {
            line,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self::new(LineSettings::default())
    }
}

impl PortBackend for SystemPorts {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        list_serial_ports()
    }

    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialLink>> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(to_serialport_data_bits(self.line.data_bits))
            .stop_bits(to_serialport_stop_bits(self.line.stop_bits))
            .parity(to_serialport_parity(self.line.parity))
            .timeout(self.read_timeout)
            .open()
            .map_err(io::Error::from)?;

        tlog!(
            "[serial] Opened {} at {} baud ({})",
            port,
            baud_rate,
            self.line.label()
        );
        Ok(Box::new(SystemLink { port: serial }))
    }
}

/// An open `serialport` device.
struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        // Drop discards queued output instead of waiting on a stalled device
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }
}
