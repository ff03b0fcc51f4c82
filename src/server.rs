// src/server.rs
//
// Network front end. One TCP listener serves both interfaces:
// - WebSocket subscribers: JSON `{"event", "data"}` frames in both directions
// - HTTP queries: GET /ports, /health, /test_backend
//
// The request head is read here; a valid `Upgrade: websocket` request is
// answered by hand and the socket handed to tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::bridge::Bridge;
use crate::events::Event;
use crate::io::SessionError;

/// Upper bound on the request line plus headers
const MAX_HEAD_BYTES: u64 = 8 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const WEBSOCKET_VERSION: &str = "13";

// ============================================================================
// Request Head
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path without the query string
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }

    /// Check the rest of an upgrade request and return its key.
    pub fn websocket_key(&self) -> Result<&str, String> {
        if self.method != "GET" {
            return Err(format!("websocket upgrade requires GET, got {}", self.method));
        }
        let connection_upgrade = self.header("connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        if !connection_upgrade {
            return Err("missing Connection: Upgrade".to_string());
        }
        if self.header("sec-websocket-version") != Some(WEBSOCKET_VERSION) {
            return Err(format!("unsupported Sec-WebSocket-Version, expected {}", WEBSOCKET_VERSION));
        }
        match self.header("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err("missing Sec-WebSocket-Key".to_string()),
        }
    }
}

/// Parse the request line and headers (terminators already stripped).
pub fn parse_request_head(lines: &[String]) -> Result<RequestHead, String> {
    let (request_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| "empty request".to_string())?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("malformed request line: {:?}", request_line));
    };
    if !version.starts_with("HTTP/") {
        return Err(format!("unsupported protocol: {}", version));
    }

    let path = target.split('?').next().unwrap_or(target).to_string();
    let headers = header_lines
        .iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(RequestHead {
        method: method.to_string(),
        path,
        headers,
    })
}

async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, String>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_HEAD_BYTES);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = limited
            .read_line(&mut line)
            .await
            .map_err(|e| format!("failed to read request: {}", e))?;
        if n == 0 {
            return Err("connection closed or request head too large".to_string());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            break;
        }
        lines.push(line.to_string());
    }
    parse_request_head(&lines)
}

// ============================================================================
// Listener
// ============================================================================

/// Accept connections until the task is dropped.
pub async fn serve(listener: TcpListener, bridge: Bridge) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tlog!("[server] Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, bridge).await {
                tlog!("[server] Connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, bridge: Bridge) -> Result<(), String> {
    let mut reader = BufReader::new(stream);
    let head = tokio::time::timeout(HEAD_TIMEOUT, read_request_head(&mut reader))
        .await
        .map_err(|_| "timed out reading request".to_string())??;

    if head.is_websocket_upgrade() {
        let key = match head.websocket_key() {
            Ok(key) => key.to_string(),
            Err(reason) => {
                tlog!("[server] Rejected upgrade from {}: {}", peer, reason);
                return write_json(&mut reader, "400 Bad Request", &json!({ "error": reason })).await;
            }
        };
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.as_bytes())
        );
        reader
            .write_all(response.as_bytes())
            .await
            .map_err(|e| format!("handshake failed: {}", e))?;

        // Anything the client sent after the head is still in the BufReader
        let ws = WebSocketStream::from_raw_socket(reader, Role::Server, None).await;
        run_subscriber(ws, peer, bridge).await;
        return Ok(());
    }

    handle_query(&mut reader, &head, &bridge).await
}

// ============================================================================
// Subscribers
// ============================================================================

async fn run_subscriber<S>(ws: WebSocketStream<S>, peer: SocketAddr, bridge: Bridge)
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    // Subscribe before the greeting so nothing published in between is lost
    let mut events = bridge.bus().subscribe();
    let (mut sink, mut incoming) = ws.split();
    tlog!(
        "[server] Subscriber {} connected ({} total)",
        peer,
        bridge.bus().subscriber_count()
    );

    let mut open = true;
    for event in bridge.greeting().await {
        if sink.send(Message::text(event.to_json())).await.is_err() {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            message = incoming.next() => {
                let replies = match message {
                    Some(Ok(Message::Text(text))) => bridge.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        let err = SessionError::MalformedCommand("binary frames are not supported".to_string());
                        vec![Event::error(&err)]
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong is answered by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tlog!("[server] Subscriber {} read error: {}", peer, e);
                        break;
                    }
                };
                for reply in replies {
                    if sink.send(Message::text(reply.to_json())).await.is_err() {
                        open = false;
                        break;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if sink.send(Message::text(event.to_json())).await.is_err() {
                        open = false;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tlog!("[server] Subscriber {} lagging, dropped {} events", peer, missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    drop(events);
    tlog!(
        "[server] Subscriber {} disconnected ({} remaining)",
        peer,
        bridge.bus().subscriber_count()
    );
}

// ============================================================================
// HTTP Queries
// ============================================================================

async fn handle_query<W>(stream: &mut W, head: &RequestHead, bridge: &Bridge) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    if head.method != "GET" {
        return write_json(
            stream,
            "405 Method Not Allowed",
            &json!({"error": format!("method {} not allowed", head.method)}),
        )
        .await;
    }

    match head.path.as_str() {
        "/ports" => match bridge.list_ports().await {
            Ok(ports) => write_json(stream, "200 OK", &json!({ "ports": ports })).await,
            Err(e) => write_json(stream, "500 Internal Server Error", &json!({"error": e.to_string()})).await,
        },
        "/health" => {
            let manager = bridge.manager();
            let status = manager.status();
            write_json(
                stream,
                "200 OK",
                &json!({
                    "status": "ok",
                    "message": "serial-bridge is running",
                    "connected": status.connected,
                    "port": status.port,
                    "baudRate": manager.baud_rate()
                }),
            )
            .await
        }
        "/test_backend" => {
            write_json(
                stream,
                "200 OK",
                &json!({"status": "ok", "message": "Backend is running and HTTP route works."}),
            )
            .await
        }
        other => write_json(stream, "404 Not Found", &json!({"error": format!("no route for {}", other)})).await,
    }
}

async fn write_json<W>(stream: &mut W, status: &str, body: &serde_json::Value) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let body = body.to_string();
    let head = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        status,
        body.len()
    );
    let write = async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body.as_bytes()).await?;
        stream.shutdown().await
    };
    write.await.map_err(|e| format!("failed to write response: {}", e))
}

// ============================================================================
// Tests
// ============================================================================
