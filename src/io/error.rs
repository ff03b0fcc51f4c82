// src/io/error.rs
//
// Typed errors for the serial session layer.
// Display strings are the messages subscribers see in `error` events.

use std::fmt;

/// Everything that can go wrong while driving the serial session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// `open_port` without a usable port name
    PortNotSpecified,
    /// Baud rate missing its numeric form or equal to zero
    InvalidBaudRate(String),
    /// A different port already owns the session
    AlreadyOpen { port: String },
    /// The driver refused to open the device
    OpenFailed { port: String, message: String },
    /// Write or command issued with no open session
    NotConnected,
    /// `send_data` without a `data` field
    DataNotSpecified,
    /// Device-level write error; the session is torn down
    WriteFailed { port: String, message: String },
    /// Device-level read error; the session is torn down
    ReadFault { port: String, message: String },
    /// Invalid UTF-8 replaced while decoding a line. Recovered locally.
    DecodeAnomaly { port: String, bytes: usize },
    /// The OS refused to list serial devices
    EnumerationFailed(String),
    /// Inbound command that does not match any known schema
    MalformedCommand(String),
}

impl SessionError {
    pub fn open_failed(port: &str, message: impl ToString) -> Self {
        SessionError::OpenFailed {
            port: port.to_string(),
            message: message.to_string(),
        }
    }

    pub fn write_failed(port: &str, message: impl ToString) -> Self {
        SessionError::WriteFailed {
            port: port.to_string(),
            message: message.to_string(),
        }
    }

    pub fn read_fault(port: &str, message: impl ToString) -> Self {
        SessionError::ReadFault {
            port: port.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the device must be considered unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::WriteFailed { .. } | SessionError::ReadFault { .. }
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::PortNotSpecified => write!(f, "No port specified."),
            SessionError::InvalidBaudRate(value) => write!(f, "Invalid baud rate: {}", value),
            SessionError::AlreadyOpen { port } => {
                write!(f, "Another port ({}) is open. Disconnect first.", port)
            }
            SessionError::OpenFailed { port, message } => {
                write!(f, "Failed to open {}: {}", port, message)
            }
            SessionError::NotConnected => write!(f, "Serial port not connected."),
            SessionError::DataNotSpecified => write!(f, "No data specified."),
            SessionError::WriteFailed { message, .. } => write!(f, "Serial write error: {}", message),
            SessionError::ReadFault { message, .. } => write!(f, "Serial read error: {}", message),
            SessionError::DecodeAnomaly { port, bytes } => write!(
                f,
                "Replaced invalid UTF-8 in {} byte line from {}",
                bytes, port
            ),
            SessionError::EnumerationFailed(message) => {
                write!(f, "Failed to enumerate ports: {}", message)
            }
            SessionError::MalformedCommand(message) => write!(f, "Malformed command: {}", message),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SessionError> for String {
    fn from(e: SessionError) -> Self {
        e.to_string()
    }
}
