// src/io/serial/reader.rs
//
// Background read loop bound to one open session.
// Polls the device, reassembles lines, decodes them lossily and publishes
// `serial_data` (plus `plot_data` when the line is a number) on the bus.
// A read fault publishes `error`, asks for teardown and ends the loop.

use std::borrow::Cow;
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::framer::LineFramer;
use crate::events::{Event, EventBus};
use crate::io::{DeviceHandle, SessionError};

const READ_CHUNK: usize = 1024;

// ============================================================================
// Types and Configuration
// ============================================================================

/// Cooperative cancellation flag, one per read loop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timing and sizing for the read loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadLoopOptions {
    /// Idle wait when the device has nothing buffered
    pub poll_interval: Duration,
    /// Input silence after which an unterminated line is delivered anyway
    pub line_timeout: Duration,
    /// Lines are split at this many bytes
    pub max_line_length: usize,
}

impl Default for ReadLoopOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            line_timeout: Duration::from_secs(1),
            max_line_length: 4096,
        }
    }
}

/// Why a read loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    Released,
    Fault,
}

impl LoopExit {
    fn as_str(self) -> &'static str {
        match self {
            LoopExit::Stopped => "stopped",
            LoopExit::Released => "device released",
            LoopExit::Fault => "read fault",
        }
    }
}

/// Called once when the loop hits a fatal read error.
pub type FaultHandler = Box<dyn FnOnce() + Send + Sync + 'static>;

// ============================================================================
// Line Decoding
// ============================================================================

/// A line decoded from raw device bytes
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedLine {
    /// Trimmed text with invalid sequences replaced by U+FFFD
    pub text: String,
    /// Whether any replacement happened
    pub replaced: bool,
}

/// Decode a raw line as UTF-8, replacing invalid sequences, and trim it.
pub fn decode_line(raw: &[u8]) -> DecodedLine {
    let decoded = String::from_utf8_lossy(raw);
    let replaced = matches!(decoded, Cow::Owned(_));
    DecodedLine {
        text: decoded.trim().to_string(),
        replaced,
    }
}

/// Secondary numeric reading of a line for plotting.
/// Only finite values qualify; JSON has no NaN or infinity.
pub fn parse_plot_value(line: &str) -> Option<f64> {
    line.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// Read Loop
// ============================================================================

/// Read loop state for one session
pub struct ReadLoop {
    session_id: u64,
    port: String,
    device: DeviceHandle,
    stop: StopSignal,
    bus: EventBus,
    options: ReadLoopOptions,
    on_fault: Option<FaultHandler>,
}

impl ReadLoop {
    pub fn new(
        session_id: u64,
        port: String,
        device: DeviceHandle,
        stop: StopSignal,
        bus: EventBus,
        options: ReadLoopOptions,
        on_fault: FaultHandler,
    ) -> Self {
        Self {
            session_id,
            port,
            device,
            stop,
            bus,
            options,
            on_fault: Some(on_fault),
        }
    }

    /// Start the loop as its own task.
    pub fn spawn(self) -> JoinHandle<LoopExit> {
        tokio::spawn(self.run())
    }

    /// Poll until stopped, released or faulted.
    pub async fn run(mut self) -> LoopExit {
        tlog!("[Serial:{}] Read loop started for {}", self.session_id, self.port);

        let mut framer = LineFramer::new(self.options.max_line_length);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut last_rx = Instant::now();

        let exit = loop {
            if self.stop.is_set() {
                break LoopExit::Stopped;
            }

            let (result, chunk) = self.poll(buf).await;
            buf = chunk;
            match result {
                Ok(n) if n > 0 => {
                    last_rx = Instant::now();
                    for line in framer.feed(&buf[..n]) {
                        self.publish_line(&line);
                    }
                    // Stay responsive to other tasks under a constant stream
                    tokio::task::yield_now().await;
                }
                Ok(_) => {
                    if framer.has_pending() && last_rx.elapsed() >= self.options.line_timeout {
                        if let Some(partial) = framer.flush() {
                            self.publish_line(&partial);
                        }
                    }
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                    break LoopExit::Released;
                }
                Err(e) => {
                    // Raised before reporting so the session reads as faulted
                    self.stop.set();
                    let err = SessionError::read_fault(&self.port, &e);
                    tlog!("[Serial:{}] {}", self.session_id, err);
                    self.bus.publish(Event::error(&err));
                    if let Some(on_fault) = self.on_fault.take() {
                        on_fault();
                    }
                    break LoopExit::Fault;
                }
            }
        };

        tlog!(
            "[Serial:{}] Read loop for {} ended ({})",
            self.session_id,
            self.port,
            exit.as_str()
        );
        exit
    }

    /// One non-waiting read, run off the async workers.
    async fn poll(&self, mut buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        let device = self.device.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = device.read_available(&mut buf);
            (result, buf)
        });
        match task.await {
            Ok(polled) => polled,
            Err(e) => (
                Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                vec![0u8; READ_CHUNK],
            ),
        }
    }

    fn publish_line(&self, raw: &[u8]) {
        let decoded = decode_line(raw);
        if decoded.replaced {
            let anomaly = SessionError::DecodeAnomaly {
                port: self.port.clone(),
                bytes: raw.len(),
            };
            tlog!("[Serial:{}] {} ({})", self.session_id, anomaly, hex::encode(raw));
        }

        let line = decoded.text;
        if line.is_empty() {
            return;
        }

        tlog!("[Serial:{}] Received: {}", self.session_id, line);
        let plot = parse_plot_value(&line);
        self.bus.publish(Event::received(line));
        if let Some(value) = plot {
            self.bus.publish(Event::PlotData { value });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
