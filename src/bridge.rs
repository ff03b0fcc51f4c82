// src/bridge.rs
//
// Routes subscriber commands to the session manager.
// `handle` returns only the replies meant for the issuing subscriber;
// everything every subscriber should see goes out on the event bus.

use std::sync::Arc;

use crate::events::{Command, Event, EventBus, SendDataRequest};
use crate::io::{PortBackend, PortInfo, SessionError};
use crate::sessions::{OpenOutcome, OutboundData, SessionConfig, SessionManager};

/// Per-process command router shared by every subscriber connection.
#[derive(Clone)]
pub struct Bridge {
    backend: Arc<dyn PortBackend>,
    manager: SessionManager,
    bus: EventBus,
    default_baud_rate: u32,
}

impl Bridge {
    pub fn new(
        backend: Arc<dyn PortBackend>,
        bus: EventBus,
        config: SessionConfig,
        default_baud_rate: u32,
    ) -> Self {
        let manager = SessionManager::new(backend.clone(), bus.clone(), config);
        Self {
            backend,
            manager,
            bus,
            default_baud_rate,
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Enumerate devices without blocking the runtime.
    pub async fn list_ports(&self) -> Result<Vec<PortInfo>, SessionError> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.list_ports())
            .await
            .map_err(|e| SessionError::EnumerationFailed(e.to_string()))?
            .map_err(|e| SessionError::EnumerationFailed(e.to_string()))
    }

    pub async fn port_list_event(&self) -> Event {
        match self.list_ports().await {
            Ok(ports) => Event::SerialPorts { ports },
            Err(e) => {
                tlog!("[bridge] {}", e);
                Event::error(&e)
            }
        }
    }

    /// Sent to a subscriber right after it connects.
    pub async fn greeting(&self) -> Vec<Event> {
        vec![
            self.port_list_event().await,
            Event::Status(self.manager.status()),
        ]
    }

    /// Parse and handle one inbound text message.
    pub async fn handle_text(&self, text: &str) -> Vec<Event> {
        match Command::parse(text) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                tlog!("[bridge] {}", e);
                vec![Event::error(&e)]
            }
        }
    }

    /// Handle one command and return the replies for its sender.
    pub async fn handle(&self, command: Command) -> Vec<Event> {
        let result = match command {
            Command::GetPorts => return vec![self.port_list_event().await],
            Command::OpenPort(request) => {
                let request = request.unwrap_or_default();
                self.open_port(request.port(), request.baud_rate(self.default_baud_rate))
                    .await
            }
            Command::ClosePort => self.manager.close().await.map(|_| None),
            Command::SendData(request) => self.send_data(request).await.map(|_| None),
            Command::TestEvent(payload) => {
                let echo = payload.unwrap_or(serde_json::Value::Null);
                tlog!("[bridge] Received test_event: {}", echo);
                Ok(Some(Event::TestResponse {
                    status: "ok".to_string(),
                    echo,
                }))
            }
        };

        match result {
            Ok(reply) => reply.into_iter().collect(),
            Err(e) => vec![Event::error(&e)],
        }
    }

    async fn open_port(
        &self,
        port: Result<&str, SessionError>,
        baud_rate: Result<u32, SessionError>,
    ) -> Result<Option<Event>, SessionError> {
        let port = port?;
        let baud_rate = baud_rate?;
        match self.manager.open(port, baud_rate).await? {
            // Already broadcast to everyone
            OpenOutcome::Opened(_) => Ok(None),
            OpenOutcome::Unchanged(status) => Ok(Some(Event::Status(status))),
        }
    }

    async fn send_data(&self, request: Option<SendDataRequest>) -> Result<(), SessionError> {
        let request = request.unwrap_or_default();
        let Some(message) = request.data.as_deref() else {
            return Err(if self.manager.status().connected {
                SessionError::DataNotSpecified
            } else {
                SessionError::NotConnected
            });
        };
        self.manager
            .write(OutboundData::from_text(message, request.suffix()))
            .await
    }
}
