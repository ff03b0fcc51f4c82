// src/lib.rs
//
// Serial bridge: one serial port shared with any number of WebSocket
// subscribers.

#[macro_use]
mod logging;

pub mod bridge;
pub mod events;
pub mod io;
pub mod server;
pub mod sessions;
pub mod settings;

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

use bridge::Bridge;
use events::EventBus;
use io::{MockBackend, PortBackend, SystemPorts};
use settings::{AppSettings, BackendKind, Cli};

/// Parse the command line, load settings and serve until Ctrl-C.
pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let settings = settings::load_settings(&cli)?;

    if let Some(ref dir) = settings.log_dir {
        logging::init_file_logging(dir)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;
    let result = runtime.block_on(run_server(settings));

    logging::stop_file_logging();
    result
}

async fn run_server(settings: AppSettings) -> Result<(), String> {
    let backend: Arc<dyn PortBackend> = match settings.backend {
        BackendKind::System => Arc::new(SystemPorts::new(settings.line_settings())),
        BackendKind::Mock => {
            tlog!("[server] Using in-memory loopback ports");
            Arc::new(MockBackend::demo().loopback())
        }
    };

    let bus = EventBus::new(settings.event_capacity);
    let bridge = Bridge::new(
        backend,
        bus,
        settings.session_config(),
        settings.default_baud_rate,
    );

    let address = settings.listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", address, e))?;
    tlog!("[server] Starting server at http://{}", address);

    tokio::select! {
        _ = server::serve(listener, bridge.clone()) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tlog!("[server] Failed to listen for Ctrl-C: {}", e);
            }
            tlog!("[server] Shutting down");
        }
    }

    // Release the device before exit
    bridge.manager().close().await.map_err(String::from)
}
