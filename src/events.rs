// src/events.rs
//
// Subscriber-facing event and command schemas, and the fan-out bus.
//
// Wire shape (both directions): {"event": "<name>", "data": {...}}

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::io::{PortInfo, SessionError};

// ============================================================================
// Outbound Events
// ============================================================================

/// Connection state as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub port: Option<String>,
}

impl StatusSnapshot {
    pub fn connected(port: &str) -> Self {
        Self {
            connected: true,
            port: Some(port.to_string()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            port: None,
        }
    }
}

/// Origin tag on `serial_data`. Absent for lines received from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataDirection {
    Sent,
}

/// Every event a subscriber can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    SerialPorts {
        ports: Vec<PortInfo>,
    },
    Status(StatusSnapshot),
    SerialData {
        data: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        direction: Option<DataDirection>,
    },
    PlotData {
        value: f64,
    },
    Error {
        message: String,
    },
    TestResponse {
        status: String,
        echo: serde_json::Value,
    },
}

impl Event {
    /// A line received from the device.
    pub fn received(line: impl Into<String>) -> Self {
        Event::SerialData {
            data: line.into(),
            direction: None,
        }
    }

    /// Local echo of a payload written to the device.
    pub fn sent(message: &str) -> Self {
        Event::SerialData {
            data: format!("-> {}", message),
            direction: Some(DataDirection::Sent),
        }
    }

    pub fn error(err: &SessionError) -> Self {
        Event::Error {
            message: err.to_string(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SerialPorts { .. } => "serial_ports",
            Event::Status(_) => "status",
            Event::SerialData { .. } => "serial_data",
            Event::PlotData { .. } => "plot_data",
            Event::Error { .. } => "error",
            Event::TestResponse { .. } => "test_response",
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"event":"error","data":{{"message":"failed to encode {}: {}"}}}}"#,
                self.name(),
                e
            )
        })
    }
}

// ============================================================================
// Inbound Commands
// ============================================================================

/// Baud rate as sent by clients: a number, or a numeric string from a `<select>`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BaudRateField {
    Number(u64),
    Text(String),
}

impl BaudRateField {
    pub fn resolve(&self) -> Result<u32, SessionError> {
        let value = match self {
            BaudRateField::Number(n) => u32::try_from(*n).ok(),
            BaudRateField::Text(s) => s.trim().parse::<u32>().ok(),
        };
        match value {
            Some(v) if v > 0 => Ok(v),
            _ => Err(SessionError::InvalidBaudRate(match self {
                BaudRateField::Number(n) => n.to_string(),
                BaudRateField::Text(s) => s.clone(),
            })),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct OpenPortRequest {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default, rename = "baudRate", alias = "baudrate", alias = "baud_rate")]
    pub baud_rate: Option<BaudRateField>,
}

impl OpenPortRequest {
    /// Port name, rejecting missing or blank values.
    pub fn port(&self) -> Result<&str, SessionError> {
        match self.port.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Ok(p),
            _ => Err(SessionError::PortNotSpecified),
        }
    }

    pub fn baud_rate(&self, default: u32) -> Result<u32, SessionError> {
        match &self.baud_rate {
            Some(field) => field.resolve(),
            None => Ok(default),
        }
    }
}

/// Suffix appended to outbound text.
/// `true` appends CRLF, a string appends itself, `false` appends nothing.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LineEnding {
    Flag(bool),
    Suffix(String),
}

impl Default for LineEnding {
    fn default() -> Self {
        LineEnding::Flag(true)
    }
}

impl LineEnding {
    pub fn suffix(&self) -> &str {
        match self {
            LineEnding::Flag(true) => "\r\n",
            LineEnding::Flag(false) => "",
            LineEnding::Suffix(s) => s,
        }
    }
}

fn default_line_ending() -> Option<LineEnding> {
    Some(LineEnding::default())
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SendDataRequest {
    #[serde(default)]
    pub data: Option<String>,
    /// `null` behaves like `false`; a missing field like `true`
    #[serde(default = "default_line_ending", rename = "addNewline", alias = "add_newline")]
    pub add_newline: Option<LineEnding>,
}

impl Default for SendDataRequest {
    fn default() -> Self {
        Self {
            data: None,
            add_newline: default_line_ending(),
        }
    }
}

impl SendDataRequest {
    pub fn suffix(&self) -> &str {
        self.add_newline.as_ref().map_or("", |e| e.suffix())
    }
}

/// Every command a subscriber can issue.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Command {
    GetPorts,
    OpenPort(Option<OpenPortRequest>),
    ClosePort,
    SendData(Option<SendDataRequest>),
    TestEvent(Option<serde_json::Value>),
}

impl Command {
    pub fn parse(text: &str) -> Result<Command, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::MalformedCommand(e.to_string()))
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Fan-out broadcaster. Every subscriber gets its own bounded queue; a
/// subscriber that falls behind loses the oldest events instead of
/// blocking the publisher or anyone else.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        // No subscribers is not an error: there is no replay
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
