// src/io/traits.rs
//
// Device seams: one open serial link, and the backend that enumerates and
// opens links. Real hardware goes through `serial::SystemPorts`, tests and
// demo mode through `mock::MockBackend`.

use std::io;

use super::PortInfo;

/// A single open serial device.
///
/// All calls are expected to return promptly: the read loop only calls
/// `read` after `bytes_to_read` reported pending input.
pub trait SerialLink: Send {
    /// Number of bytes buffered by the driver and ready to read.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole payload and flush it to the device.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Release the device. Called exactly once, after the read loop is done with it.
    fn close(&mut self) -> io::Result<()>;
}

/// Lists and opens serial devices.
pub trait PortBackend: Send + Sync {
    /// Currently available devices. Pure query, no side effects.
    fn list_ports(&self) -> io::Result<Vec<PortInfo>>;

    /// Acquire the device at `port`.
    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialLink>>;
}
