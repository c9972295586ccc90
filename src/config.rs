//! # Configuration Management
//!
//! Centralized configuration for the session engine.
//!
//! The wire-level knobs are plain named constants. `ServerConfig` and
//! `ClientConfig` bundle them with the per-instance settings a host chooses
//! (bind address, capacity, display name) and default to the constants.
//!
//! ## Validation
//! Every config struct exposes `validate()`, returning a list of problems, and
//! `validate_strict()`, which turns a non-empty list into a `ConfigError`.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Size in bytes of the buffer each read from a socket fills
pub const DATA_BUFFER_SIZE: usize = 4096;

/// Default port for both the TCP listener and the UDP socket
pub const DEFAULT_PORT: u16 = 25898;

/// Loopback address used when no address is configured
pub const LOCALHOST: &str = "127.0.0.1";

/// Message id reserved for the identity handshake
pub const HANDSHAKE_MESSAGE_ID: i32 = 0;

/// Greeting sent with every welcome packet
pub const DEFAULT_WELCOME_MESSAGE: &str = "Welcome to the Server";

/// Largest frame a stream will accept before it is treated as corrupt (16 MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Receive buffer for every UDP socket, large enough for any datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Declared frame length that marks the end of pending work on a stream
pub const KEEP_ALIVE_LENGTH: i32 = 1;

/// Width of every length prefix and session id tag on the wire
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the TCP listener and UDP socket bind to
    pub address: String,

    /// Port shared by the TCP listener and the UDP socket (0 lets the OS pick)
    pub port: u16,

    /// Number of session slots; ids are drawn from `1..=max_sessions`
    pub max_sessions: usize,

    /// Initial TCP read buffer; UDP always receives into `MAX_DATAGRAM_SIZE`
    pub receive_buffer_size: usize,

    /// Text carried by the welcome packet
    pub welcome_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from(LOCALHOST),
            port: DEFAULT_PORT,
            max_sessions: 4,
            receive_buffer_size: DATA_BUFFER_SIZE,
            welcome_message: String::from(DEFAULT_WELCOME_MESSAGE),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.trim().is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "Invalid server address: '{}' (expected an IP address such as '0.0.0.0')",
                self.address
            ));
        }

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        } else if self.max_sessions > i32::MAX as usize {
            errors.push(format!(
                "Max sessions too large: {} (session ids are 32-bit)",
                self.max_sessions
            ));
        }

        errors.extend(validate_buffer_size(self.receive_buffer_size));

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Server host name or IP address
    pub address: String,

    /// Server port
    pub port: u16,

    /// Name announced to the server during the handshake
    pub display_name: String,

    /// Initial TCP read buffer; UDP always receives into `MAX_DATAGRAM_SIZE`
    pub receive_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from(LOCALHOST),
            port: DEFAULT_PORT,
            display_name: String::new(),
            receive_buffer_size: DATA_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a client configuration for `display_name` against the default server
    pub fn new<S: Into<String>>(display_name: S) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.display_name.trim().is_empty() {
            errors.push(format!(
                "The display name '{}' is not valid",
                self.display_name
            ));
        }

        if self.address.trim().is_empty() {
            errors.push(format!("The address '{}' is not valid", self.address));
        }

        if self.port == 0 {
            errors.push(format!("The port '{}' is not valid", self.port));
        }

        errors.extend(validate_buffer_size(self.receive_buffer_size));

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

fn validate_buffer_size(size: usize) -> Vec<String> {
    let mut errors = Vec::new();
    if size < 16 {
        errors.push(format!("Receive buffer too small: {size} bytes (minimum: 16)"));
    } else if size > MAX_PACKET_SIZE {
        errors.push(format!(
            "Receive buffer too large: {size} bytes (maximum: {MAX_PACKET_SIZE})"
        ));
    }
    errors
}

fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(NetError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
