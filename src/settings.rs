// src/settings.rs
//
// Application settings: a TOML file with per-field defaults, overridden by
// command-line flags.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::serial::utils::{LineSettings, Parity};
use crate::sessions::SessionConfig;

const SETTINGS_DIR: &str = "serial-bridge";
const SETTINGS_FILE: &str = "settings.toml";

// ============================================================================
// Command Line
// ============================================================================

/// Bridges one serial port to WebSocket subscribers.
#[derive(Parser, Debug, Default)]
#[command(name = "serial-bridge", version, about)]
pub struct Cli {
    /// Settings file (defaults to <config dir>/serial-bridge/settings.toml).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    pub bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Baud rate used when `open_port` does not name one.
    #[arg(long)]
    pub baud: Option<u32>,

    /// Serve two in-memory loopback ports instead of real devices.
    #[arg(long)]
    pub mock: bool,

    /// Also write the log to a timestamped file in this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

// ============================================================================
// Settings
// ============================================================================

/// Where serial devices come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    System,
    Mock,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_line_timeout_ms")]
    pub line_timeout_ms: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    // Line settings
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_close_timeout_ms() -> u64 {
    1000
}

fn default_line_timeout_ms() -> u64 {
    1000
}

fn default_max_line_length() -> usize {
    4096
}

fn default_event_capacity() -> usize {
    256
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            default_baud_rate: default_baud_rate(),
            poll_interval_ms: default_poll_interval_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            line_timeout_ms: default_line_timeout_ms(),
            max_line_length: default_max_line_length(),
            event_capacity: default_event_capacity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            backend: BackendKind::default(),
            log_dir: None,
        }
    }
}

impl AppSettings {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_baud_rate == 0 {
            return Err("default_baud_rate must be greater than zero".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than zero".to_string());
        }
        if self.max_line_length == 0 {
            return Err("max_line_length must be greater than zero".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than zero".to_string());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("data_bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("stop_bits must be 1 or 2, got {}", self.stop_bits));
        }
        Ok(())
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ref bind) = cli.bind {
            self.bind_address = bind.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(baud) = cli.baud {
            self.default_baud_rate = baud;
        }
        if cli.mock {
            self.backend = BackendKind::Mock;
        }
        if let Some(ref dir) = cli.log_dir {
            self.log_dir = Some(dir.clone());
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            line_timeout: Duration::from_millis(self.line_timeout_ms),
            max_line_length: self.max_line_length,
        }
    }

    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Default settings path under the user's config directory.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
}

/// Parse a settings file.
pub fn load_from_file(path: &Path) -> Result<AppSettings, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings {}: {}", path.display(), e))?;
    toml::from_str(&text).map_err(|e| format!("Invalid settings {}: {}", path.display(), e))
}

/// Resolve settings from the file named on the command line (must exist) or
/// the default location (optional), then apply the remaining flags.
pub fn load_settings(cli: &Cli) -> Result<AppSettings, String> {
    let mut settings = match cli.config {
        Some(ref path) => load_from_file(path)?,
        None => match default_settings_path() {
            Some(path) if path.exists() => load_from_file(&path)?,
            _ => AppSettings::default(),
        },
    };
    settings.apply_cli(cli);
    settings.validate()?;
    Ok(settings)
}
