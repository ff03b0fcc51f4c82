// src/io/mock.rs
//
// In-memory serial devices. Used by the test suites and by `--mock` demo
// mode, where every written byte is looped back as input.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{PortBackend, SerialLink};
use super::PortInfo;

// ============================================================================
// Port State
// ============================================================================

#[derive(Default)]
struct MockPortState {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    read_error: Option<String>,
    write_error: Option<String>,
    loopback: bool,
    closed: bool,
    close_count: usize,
    baud_rate: u32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side control over one opened mock device.
#[derive(Clone)]
pub struct MockPortHandle {
    state: Arc<Mutex<MockPortState>>,
}

impl MockPortHandle {
    /// Queue bytes as if the device had sent them.
    pub fn push_input(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes.iter().copied());
    }

    /// Make every following read fail with `message`.
    pub fn fail_reads(&self, message: &str) {
        lock(&self.state).read_error = Some(message.to_string());
    }

    /// Make every following write fail with `message`.
    pub fn fail_writes(&self, message: &str) {
        lock(&self.state).write_error = Some(message.to_string());
    }

    /// Everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    pub fn baud_rate(&self) -> u32 {
        lock(&self.state).baud_rate
    }
}

struct MockLink {
    state: Arc<Mutex<MockPortState>>,
}

impl SerialLink for MockLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let state = lock(&self.state);
        if let Some(ref message) = state.read_error {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
        }
        Ok(state.rx.len() as u32)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if let Some(ref message) = state.read_error {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if let Some(ref message) = state.write_error {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
        }
        state.written.extend_from_slice(data);
        if state.loopback {
            state.rx.extend(data.iter().copied());
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.close_count += 1;
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
struct MockBackendState {
    ports: Vec<PortInfo>,
    opened: HashMap<String, MockPortHandle>,
    open_error: Option<String>,
    loopback: bool,
}

/// Backend serving a fixed list of in-memory devices.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockBackendState>>,
}

impl MockBackend {
    pub fn with_ports(ports: Vec<PortInfo>) -> Self {
        let backend = Self::default();
        lock(&backend.state).ports = ports;
        backend
    }

    /// The two-port setup used by demo mode and most tests.
    pub fn demo() -> Self {
        Self::with_ports(vec![
            PortInfo::new("/dev/ttyACM0", "USB Serial Device"),
            PortInfo::new("/dev/ttyS0", "ttyS0 Serial Port"),
        ])
    }

    /// Echo written bytes back as device input on every port opened afterwards.
    pub fn loopback(self) -> Self {
        lock(&self.state).loopback = true;
        self
    }

    /// Make the next `open` fail with `message`.
    pub fn fail_next_open(&self, message: &str) {
        lock(&self.state).open_error = Some(message.to_string());
    }

    /// Control handle for the most recent device opened at `port`.
    pub fn port(&self, port: &str) -> Option<MockPortHandle> {
        lock(&self.state).opened.get(port).cloned()
    }
}

impl PortBackend for MockBackend {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        Ok(lock(&self.state).ports.clone())
    }

    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn SerialLink>> {
        let mut state = lock(&self.state);
        if let Some(message) = state.open_error.take() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, message));
        }
        if !state.ports.iter().any(|p| p.device == port) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not open port {}: No such file or directory", port),
            ));
        }

        let port_state = Arc::new(Mutex::new(MockPortState {
            loopback: state.loopback,
            baud_rate,
            ..MockPortState::default()
        }));
        state.opened.insert(
            port.to_string(),
            MockPortHandle {
                state: port_state.clone(),
            },
        );
        Ok(Box::new(MockLink { state: port_state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_port_fails_to_open() {
        let backend = MockBackend::demo();
        let err = backend.open("/dev/ttyUSB7", 9600).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fail_next_open_is_one_shot() {
        let backend = MockBackend::demo();
        backend.fail_next_open("Permission denied");
        assert!(backend.open("/dev/ttyACM0", 9600).is_err());
        assert!(backend.open("/dev/ttyACM0", 9600).is_ok());
    }

    #[test]
    fn test_loopback_echoes_writes() {
        let backend = MockBackend::demo().loopback();
        let mut link = backend.open("/dev/ttyS0", 115200).unwrap();
        link.write_all(b"ping\n").unwrap();
        assert_eq!(link.bytes_to_read().unwrap(), 5);
        let handle = backend.port("/dev/ttyS0").unwrap();
        assert_eq!(handle.written(), b"ping\n");
        assert_eq!(handle.baud_rate(), 115200);
    }
}
