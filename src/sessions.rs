// src/sessions.rs
//
// Serial session lifecycle.
// Owns the single open device, starts and stops its read loop, and
// publishes status changes on the event bus. Open and close are serialized
// by one async lifecycle lock; the session slot itself sits behind a plain
// mutex held only for state checks and swaps, so status reads never wait on
// device I/O.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::events::{Event, EventBus, StatusSnapshot};
use crate::io::serial::reader::{FaultHandler, LoopExit, ReadLoop, ReadLoopOptions, StopSignal};
use crate::io::{DeviceHandle, PortBackend, SessionError};

// ============================================================================
// Types
// ============================================================================

/// Timing for session teardown and the read loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    /// Upper bound on waiting for the read loop during close
    pub close_timeout: Duration,
    pub line_timeout: Duration,
    pub max_line_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            close_timeout: Duration::from_secs(1),
            line_timeout: Duration::from_secs(1),
            max_line_length: 4096,
        }
    }
}

impl SessionConfig {
    fn read_loop_options(&self) -> ReadLoopOptions {
        ReadLoopOptions {
            poll_interval: self.poll_interval,
            line_timeout: self.line_timeout,
            max_line_length: self.max_line_length,
        }
    }
}

/// Result of a successful `open`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new session was started and its status broadcast
    Opened(StatusSnapshot),
    /// The port was already open; nothing changed
    Unchanged(StatusSnapshot),
}

impl OpenOutcome {
    pub fn status(&self) -> &StatusSnapshot {
        match self {
            OpenOutcome::Opened(s) | OpenOutcome::Unchanged(s) => s,
        }
    }
}

/// Bytes to write plus the text echoed back to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundData {
    pub bytes: Vec<u8>,
    pub echo: String,
}

impl OutboundData {
    /// Text payload with a line-ending suffix. The echo omits the suffix.
    pub fn from_text(message: &str, suffix: &str) -> Self {
        let mut bytes = Vec::with_capacity(message.len() + suffix.len());
        bytes.extend_from_slice(message.as_bytes());
        bytes.extend_from_slice(suffix.as_bytes());
        Self {
            bytes,
            echo: message.to_string(),
        }
    }
}

struct ActiveSession {
    id: u64,
    port: String,
    baud_rate: u32,
    device: DeviceHandle,
    stop: StopSignal,
    reader: Option<JoinHandle<LoopExit>>,
}

impl ActiveSession {
    /// Read loop faulted (it raises its own stop signal) but the teardown
    /// has not run yet.
    fn is_stale(&self) -> bool {
        self.stop.is_set()
            || !self.device.is_open()
            || self.reader.as_ref().is_some_and(|r| r.is_finished())
    }
}

struct Inner {
    backend: Arc<dyn PortBackend>,
    bus: EventBus,
    config: SessionConfig,
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

// ============================================================================
// Session Manager
// ============================================================================

/// Owner of the single serial session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn PortBackend>, bus: EventBus, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                bus,
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection state.
    pub fn status(&self) -> StatusSnapshot {
        match self.active().as_ref() {
            Some(session) => StatusSnapshot::connected(&session.port),
            None => StatusSnapshot::disconnected(),
        }
    }

    /// Baud rate of the open session, if any.
    pub fn baud_rate(&self) -> Option<u32> {
        self.active().as_ref().map(|s| s.baud_rate)
    }

    /// Open `port` and start its read loop.
    ///
    /// Re-opening the port that is already open is a no-op. A different
    /// open port must be closed first.
    pub async fn open(&self, port: &str, baud_rate: u32) -> Result<OpenOutcome, SessionError> {
        let port = port.trim();
        if port.is_empty() {
            return Err(SessionError::PortNotSpecified);
        }
        if baud_rate == 0 {
            return Err(SessionError::InvalidBaudRate(baud_rate.to_string()));
        }

        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self
            .active()
            .as_ref()
            .map(|s| (s.id, s.port.clone(), s.is_stale()));
        if let Some((id, current_port, stale)) = current {
            if stale {
                tlog!("[session] Clearing faulted session {} on {}", id, current_port);
                if self.teardown(Some(id)).await.is_some() {
                    self.inner.bus.publish(Event::Status(StatusSnapshot::disconnected()));
                }
            } else if current_port == port {
                return Ok(OpenOutcome::Unchanged(StatusSnapshot::connected(port)));
            } else {
                return Err(SessionError::AlreadyOpen { port: current_port });
            }
        }

        let backend = self.inner.backend.clone();
        let port_owned = port.to_string();
        let link = tokio::task::spawn_blocking(move || backend.open(&port_owned, baud_rate))
            .await
            .map_err(|e| SessionError::open_failed(port, e))?
            .map_err(|e| {
                let err = SessionError::open_failed(port, e);
                tlog!("[session] {}", err);
                err
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let device = DeviceHandle::new(link);
        let stop = StopSignal::new();
        let read_loop = ReadLoop::new(
            id,
            port.to_string(),
            device.clone(),
            stop.clone(),
            self.inner.bus.clone(),
            self.inner.config.read_loop_options(),
            self.fault_handler(id),
        );

        tlog!("[session] Opened {} at {} baud (session {})", port, baud_rate, id);

        // A fault teardown needs the lifecycle lock, so it cannot run before
        // the session is stored below
        let reader = read_loop.spawn();
        *self.active() = Some(ActiveSession {
            id,
            port: port.to_string(),
            baud_rate,
            device,
            stop,
            reader: Some(reader),
        });

        // Announce only once status() and write() see the session
        let status = StatusSnapshot::connected(port);
        self.inner.bus.publish(Event::Status(status.clone()));

        Ok(OpenOutcome::Opened(status))
    }

    /// Close the open session, if any. Always broadcasts a disconnected status.
    pub async fn close(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown(None).await;
        self.inner.bus.publish(Event::Status(StatusSnapshot::disconnected()));
        Ok(())
    }

    /// Close session `id` after a device fault.
    /// Ignored when that session has already been replaced or closed.
    pub async fn close_session(&self, id: u64) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.teardown(Some(id)).await.is_some() {
            self.inner.bus.publish(Event::Status(StatusSnapshot::disconnected()));
        }
    }

    /// Write to the open device and broadcast the echo.
    /// A device-level failure schedules teardown of the session.
    pub async fn write(&self, data: OutboundData) -> Result<(), SessionError> {
        let (id, port, device) = self
            .active()
            .as_ref()
            .map(|s| (s.id, s.port.clone(), s.device.clone()))
            .ok_or(SessionError::NotConnected)?;

        let OutboundData { bytes, echo } = data;
        let result = tokio::task::spawn_blocking(move || device.write_all(&bytes))
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())));

        let err = match result {
            Ok(()) => {
                tlog!("[Serial:{}] Sent: {}", id, echo.escape_debug());
                self.inner.bus.publish(Event::sent(&echo));
                return Ok(());
            }
            // Closed between the state check and the write
            Err(e) if e.kind() == io::ErrorKind::NotConnected => SessionError::NotConnected,
            Err(e) => SessionError::write_failed(&port, &e),
        };
        if err.is_fatal() {
            tlog!("[Serial:{}] {}", id, err);
            self.spawn_close(id);
        }
        Err(err)
    }

    fn spawn_close(&self, id: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.close_session(id).await;
        });
    }

    fn fault_handler(&self, id: u64) -> FaultHandler {
        // Weak so a running loop does not keep the manager alive
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                SessionManager { inner }.spawn_close(id);
            }
        })
    }

    /// Stop the read loop and release the device of the current session
    /// (or only of session `only`). Caller holds the lifecycle lock.
    /// Returns the closed port.
    async fn teardown(&self, only: Option<u64>) -> Option<String> {
        let (id, port, device, stop, reader) = {
            let mut guard = self.active();
            let session = guard.as_mut()?;
            if only.is_some_and(|want| want != session.id) {
                return None;
            }
            (
                session.id,
                session.port.clone(),
                session.device.clone(),
                session.stop.clone(),
                session.reader.take(),
            )
        };

        stop.set();
        if let Some(reader) = reader {
            match tokio::time::timeout(self.inner.config.close_timeout, reader).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tlog!("[session] Read loop for session {} panicked: {}", id, e),
                Err(_) => tlog!(
                    "[session] Read loop for session {} did not stop within {:?}, releasing anyway",
                    id,
                    self.inner.config.close_timeout
                ),
            }
        }

        // Release takes the link out of the handle, so a loop that outlived
        // the timeout sees NotConnected instead of a closed device
        match tokio::task::spawn_blocking(move || device.release()).await {
            Ok(Some(Err(e))) => tlog!("[session] Error closing {}: {}", port, e),
            Ok(_) => {}
            Err(e) => tlog!("[session] Close task for {} failed: {}", port, e),
        }
        stop.clear();

        let mut guard = self.active();
        if guard.as_ref().is_some_and(|s| s.id == id) {
            *guard = None;
        }
        drop(guard);

        tlog!("[session] Closed {} (session {})", port, id);
        Some(port)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MockBackend, PortInfo, SerialLink};
    use std::time::Instant;
    use tokio::sync::broadcast;
    use tokio::time::{sleep, timeout};

    const ACM0: &str = "/dev/ttyACM0";
    const S0: &str = "/dev/ttyS0";

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(2),
            close_timeout: Duration::from_millis(200),
            line_timeout: Duration::from_millis(50),
            max_line_length: 256,
        }
    }

    fn setup() -> (MockBackend, SessionManager, broadcast::Receiver<Event>) {
        let backend = MockBackend::demo();
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        let manager = SessionManager::new(Arc::new(backend.clone()), bus, fast_config());
        (backend, manager, rx)
    }

    async fn next(rx: &mut broadcast::Receiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    async fn assert_quiet(rx: &mut broadcast::Receiver<Event>) {
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "unexpected extra event");
    }

    fn connected(port: &str) -> Event {
        Event::Status(StatusSnapshot::connected(port))
    }

    fn disconnected() -> Event {
        Event::Status(StatusSnapshot::disconnected())
    }

    #[test]
    fn test_outbound_from_text() {
        let out = OutboundData::from_text("Hello", "\r\n");
        assert_eq!(out.bytes, b"Hello\r\n");
        assert_eq!(out.echo, "Hello");
    }

    #[tokio::test]
    async fn test_open_broadcasts_connected() {
        let (backend, manager, mut rx) = setup();
        let outcome = manager.open(ACM0, 115200).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Opened(StatusSnapshot::connected(ACM0)));
        assert_eq!(next(&mut rx).await, connected(ACM0));
        assert_eq!(manager.status(), StatusSnapshot::connected(ACM0));
        assert_eq!(manager.baud_rate(), Some(115200));
        assert_eq!(backend.port(ACM0).unwrap().baud_rate(), 115200);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_same_port_is_noop() {
        let (_backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let outcome = manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Unchanged(StatusSnapshot::connected(ACM0)));
        assert_quiet(&mut rx).await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_port_is_rejected() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let err = manager.open(S0, 9600).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::AlreadyOpen {
                port: ACM0.to_string()
            }
        );
        assert_eq!(err.to_string(), "Another port (/dev/ttyACM0) is open. Disconnect first.");

        // Original session untouched
        assert_eq!(manager.status(), StatusSnapshot::connected(ACM0));
        assert!(!backend.port(ACM0).unwrap().is_closed());
        assert!(backend.port(S0).is_none());
        assert_quiet(&mut rx).await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_validates_arguments() {
        let (_backend, manager, _rx) = setup();
        assert_eq!(manager.open("  ", 9600).await, Err(SessionError::PortNotSpecified));
        assert!(matches!(
            manager.open(ACM0, 0).await,
            Err(SessionError::InvalidBaudRate(_))
        ));
    }

    #[tokio::test]
    async fn test_open_failure_passes_message_through() {
        let (backend, manager, mut rx) = setup();
        backend.fail_next_open("Permission denied");
        let err = manager.open(ACM0, 9600).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to open /dev/ttyACM0: Permission denied");
        assert_eq!(manager.status(), StatusSnapshot::disconnected());
        assert_quiet(&mut rx).await;

        let err = manager.open("/dev/ttyUSB9", 9600).await.unwrap_err();
        assert!(matches!(err, SessionError::OpenFailed { .. }));
    }

    #[tokio::test]
    async fn test_close_without_session_is_idempotent() {
        let (_backend, manager, mut rx) = setup();
        manager.close().await.unwrap();
        assert_eq!(next(&mut rx).await, disconnected());
        manager.close().await.unwrap();
        assert_eq!(next(&mut rx).await, disconnected());
    }

    #[tokio::test]
    async fn test_close_releases_device_once() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        manager.close().await.unwrap();
        assert_eq!(next(&mut rx).await, disconnected());
        manager.close().await.unwrap();
        assert_eq!(next(&mut rx).await, disconnected());

        let port = backend.port(ACM0).unwrap();
        assert!(port.is_closed());
        assert_eq!(port.close_count(), 1);
        assert_eq!(manager.status(), StatusSnapshot::disconnected());
    }

    #[tokio::test]
    async fn test_write_without_session() {
        let (_backend, manager, mut rx) = setup();
        let err = manager
            .write(OutboundData::from_text("Hello", "\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
        assert!(err.to_string().to_lowercase().contains("not connected"));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_write_with_custom_suffix() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        manager.write(OutboundData::from_text("Hello", "\n")).await.unwrap();
        assert_eq!(backend.port(ACM0).unwrap().written(), b"Hello\n");
        assert_eq!(next(&mut rx).await, Event::sent("Hello"));
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_received_lines_are_published() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let port = backend.port(ACM0).unwrap();
        port.push_input(b"3.14\r\nhello\r\n");
        assert_eq!(next(&mut rx).await, Event::received("3.14"));
        assert_eq!(next(&mut rx).await, Event::PlotData { value: 3.14 });
        assert_eq!(next(&mut rx).await, Event::received("hello"));
        assert_quiet(&mut rx).await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_fault_tears_down_once() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let port = backend.port(ACM0).unwrap();
        port.fail_reads("device reports readiness to read but returned no data");
        match next(&mut rx).await {
            Event::Error { message } => assert!(message.starts_with("Serial read error:")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(next(&mut rx).await, disconnected());
        port.push_input(b"late\n");
        assert_quiet(&mut rx).await;

        assert_eq!(manager.status(), StatusSnapshot::disconnected());
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_racing_fault_teardown_closes_once() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let port = backend.port(ACM0).unwrap();
        port.fail_reads("unplugged");
        assert!(matches!(next(&mut rx).await, Event::Error { .. }));
        manager.close().await.unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(port.close_count(), 1);
        assert_eq!(manager.status(), StatusSnapshot::disconnected());
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        let port = backend.port(ACM0).unwrap();
        port.fail_writes("Input/output error");
        let err = manager
            .write(OutboundData::from_text("Hello", "\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Serial write error: Input/output error");
        assert!(err.is_fatal());

        assert_eq!(next(&mut rx).await, disconnected());
        assert_eq!(manager.status(), StatusSnapshot::disconnected());
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn test_open_after_fault_replaces_stale_session() {
        let (backend, manager, mut rx) = setup();
        manager.open(ACM0, 9600).await.unwrap();
        assert_eq!(next(&mut rx).await, connected(ACM0));

        backend.port(ACM0).unwrap().fail_reads("gone");
        assert!(matches!(next(&mut rx).await, Event::Error { .. }));

        // Whether or not the fault teardown ran yet, a fresh open succeeds
        let outcome = manager.open(S0, 9600).await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened(_)));

        // The pending teardown for the old session must not touch the new one
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status(), StatusSnapshot::connected(S0));
        assert!(!backend.port(S0).unwrap().is_closed());
        manager.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_usable_once_connected_is_seen() {
        let (_backend, manager, mut rx) = setup();
        for _ in 0..200 {
            let opening = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.open(ACM0, 9600).await })
            };
            while next(&mut rx).await != connected(ACM0) {}

            assert_eq!(manager.status(), StatusSnapshot::connected(ACM0));
            manager.write(OutboundData::from_text("ping", "\n")).await.unwrap();

            opening.await.unwrap().unwrap();
            manager.close().await.unwrap();
        }
    }

    /// Device whose writes take far longer than a poll interval.
    struct SlowLink;

    impl SerialLink for SlowLink {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(0)
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct SlowBackend;

    impl PortBackend for SlowBackend {
        fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
            Ok(Vec::new())
        }

        fn open(&self, _port: &str, _baud_rate: u32) -> io::Result<Box<dyn SerialLink>> {
            Ok(Box::new(SlowLink))
        }
    }

    #[tokio::test]
    async fn test_slow_write_keeps_runtime_responsive() {
        let manager = SessionManager::new(Arc::new(SlowBackend), EventBus::new(16), fast_config());
        manager.open("/dev/ttySLOW", 9600).await.unwrap();

        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.write(OutboundData::from_text("x", "\n")).await })
        };
        // Let the write take the device
        sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        let started = Instant::now();
        manager.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.status(), StatusSnapshot::disconnected());
        assert!(matches!(
            writer.await.unwrap(),
            Ok(()) | Err(SessionError::NotConnected)
        ));
    }
}
