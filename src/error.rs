//! # Error Types
//!
//! Error handling for the session engine.
//!
//! This module defines every error that can surface from the engine, from
//! argument validation on the host thread to protocol violations detected while
//! pumping inbound work.
//!
//! ## Error Categories
//! - **Validation**: malformed connect arguments or configuration, raised before any I/O
//! - **Transport**: connection failures, sends while disconnected, socket errors
//! - **Protocol**: handshake identity mismatches, malformed or oversized frames
//! - **Dispatch**: duplicate, invalid or unknown handler ids
//! - **Packet**: reads past the written content of a [`Packet`](crate::core::packet::Packet)
//!
//! Errors raised on I/O tasks never cross thread boundaries as values; they are
//! reported through the channel's disconnect notification instead
//! (see [`DisconnectReason`](crate::transport::DisconnectReason)).
//!
//! ## Example Usage
//! ```rust
//! use netplay_engine::core::packet::Packet;
//! use netplay_engine::error::{NetError, Result};
//!
//! fn read_score(packet: &mut Packet) -> Result<i32> {
//!     packet.read_i32()
//! }
//!
//! let mut empty = Packet::new();
//! assert!(matches!(read_score(&mut empty), Err(NetError::BufferUnderrun { .. })));
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::service::session::SessionId;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Validation messages
    pub const ERR_NO_RUNTIME: &str = "No tokio runtime available on the calling thread";
    pub const ERR_ALREADY_RUNNING: &str = "Server is already running";
    pub const ERR_ALREADY_CONNECTING: &str = "Connection already in progress";

    /// Packet messages
    pub const ERR_NEGATIVE_STRING_LENGTH: &str = "Negative string length prefix";
    pub const ERR_INVALID_UTF8: &str = "String payload is not valid UTF-8";
    pub const ERR_SHORT_DATAGRAM: &str = "Datagram shorter than its length prefix";
    pub const ERR_NEGATIVE_FRAME_LENGTH: &str = "Datagram declares a negative frame length";

    /// Handshake messages
    pub const ERR_DUPLICATE_WELCOME: &str = "Welcome received after identity was already assigned";
    pub const ERR_NON_POSITIVE_ID: &str = "Server assigned a non-positive session id";
}

/// NetError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error(
        "Protocol violation: session {session} confirmed id {received} (expected {expected}) as \"{display_name}\""
    )]
    ProtocolViolation {
        session: SessionId,
        expected: i32,
        received: i32,
        display_name: String,
    },

    #[error("Handler id {0} is already registered")]
    DuplicateHandlerId(i32),

    #[error("Handler id {0} is invalid (must not be negative)")]
    InvalidHandlerId(i32),

    #[error("No handler registered for id {0}")]
    UnknownHandlerId(i32),

    #[error("Server is full, rejected {peer}")]
    ServerFull { peer: SocketAddr },

    #[error("Buffer underrun: requested {requested} bytes, {available} available")]
    BufferUnderrun { requested: usize, available: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using NetError
pub type Result<T> = std::result::Result<T, NetError>;
