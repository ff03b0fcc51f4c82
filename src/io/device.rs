// src/io/device.rs
//
// Shared, releasable handle to the open serial link.
// The read loop and writers both go through this handle; once it has been
// released every call fails with `ErrorKind::NotConnected`, so nothing can
// touch a device after it was closed.
// Polling never waits for the lock: a write in progress reads as idle.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use super::traits::SerialLink;

/// Clonable handle to the single open device.
#[derive(Clone)]
pub struct DeviceHandle {
    link: Arc<Mutex<Option<Box<dyn SerialLink>>>>,
}

impl DeviceHandle {
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        Self {
            link: Arc::new(Mutex::new(Some(link))),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<Box<dyn SerialLink>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` while another call holds the link.
    fn try_guard(&self) -> Option<MutexGuard<'_, Option<Box<dyn SerialLink>>>> {
        match self.link.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// True until `release` has run.
    pub fn is_open(&self) -> bool {
        // Busy means a read or write is using the link
        self.try_guard().map_or(true, |guard| guard.is_some())
    }

    /// Read whatever the driver has buffered, without waiting for more.
    /// Returns `Ok(0)` when nothing is pending or a write holds the device.
    pub fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut guard) = self.try_guard() else {
            return Ok(0);
        };
        let link = guard.as_mut().ok_or_else(released)?;
        let pending = link.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        link.read(&mut buf[..want])
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.guard();
        let link = guard.as_mut().ok_or_else(released)?;
        link.write_all(data)
    }

    /// Take the link out of the handle and close it.
    /// Returns `None` when it had already been released, so a device is
    /// never closed twice.
    pub fn release(&self) -> Option<io::Result<()>> {
        let link = self.guard().take();
        link.map(|mut link| link.close())
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device handle released")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::MockBackend;
    use crate::io::traits::PortBackend;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Link whose writes park until the test lets them finish.
    struct GatedLink {
        entered: mpsc::Sender<()>,
        gate: mpsc::Receiver<()>,
    }

    impl SerialLink for GatedLink {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(3)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf[..3].copy_from_slice(b"abc");
            Ok(3)
        }

        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_mock() -> (MockBackend, DeviceHandle) {
        let backend = MockBackend::demo();
        let link = backend.open("/dev/ttyACM0", 9600).expect("open mock");
        (backend, DeviceHandle::new(link))
    }

    #[test]
    fn test_read_available_returns_zero_when_idle() {
        let (_backend, device) = open_mock();
        let mut buf = [0u8; 16];
        assert_eq!(device.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_available_caps_to_buffer() {
        let (backend, device) = open_mock();
        backend.port("/dev/ttyACM0").unwrap().push_input(b"0123456789");
        let mut buf = [0u8; 4];
        assert_eq!(device.read_available(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn test_release_is_once_only() {
        let (backend, device) = open_mock();
        assert!(device.is_open());
        assert!(matches!(device.release(), Some(Ok(()))));
        assert!(device.release().is_none());
        assert!(!device.is_open());
        assert_eq!(backend.port("/dev/ttyACM0").unwrap().close_count(), 1);
    }

    #[test]
    fn test_released_handle_reports_not_connected() {
        let (_backend, device) = open_mock();
        device.release();
        let err = device.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let mut buf = [0u8; 4];
        let err = device.read_available(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_read_available_does_not_wait_for_writer() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let device = DeviceHandle::new(Box::new(GatedLink {
            entered: entered_tx,
            gate: gate_rx,
        }));

        let writer = {
            let device = device.clone();
            std::thread::spawn(move || device.write_all(b"slow"))
        };
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(device.read_available(&mut buf).unwrap(), 0);
        assert!(device.is_open());
        assert!(started.elapsed() < Duration::from_millis(100));

        gate_tx.send(()).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(device.read_available(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
    }
}
