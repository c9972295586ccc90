//! # Transport Layer
//!
//! Socket plumbing for the two channels every session owns.
//!
//! - [`stream::StreamChannel`]: reliable, ordered TCP with length-prefixed framing
//! - [`datagram::DatagramChannel`]: best-effort UDP, one packet per datagram
//!
//! Channels run their socket work on tokio tasks. Those tasks never touch
//! session state; everything they observe is handed to an [`InboundSink`],
//! which in practice forwards it onto the host's
//! [`MainThreadQueue`](crate::utils::main_thread::MainThreadQueue).

pub mod datagram;
pub mod stream;

use crate::core::packet::Packet;
use std::fmt;
use std::net::SocketAddr;

/// Which channel a packet or notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Stream,
    Datagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => f.write_str("tcp"),
            Transport::Datagram => f.write_str("udp"),
        }
    }
}

/// Why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The host called `disconnect`
    Local,
    /// The peer closed the stream or sent a terminating length prefix
    RemoteClosed,
    /// A socket operation failed
    Io(String),
    /// The peer sent bytes that cannot be framed
    Malformed(String),
    /// The handshake identity did not match the assigned id
    ProtocolViolation,
    /// The server shut down
    ServerStopped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("disconnected locally"),
            DisconnectReason::RemoteClosed => f.write_str("closed by peer"),
            DisconnectReason::Io(e) => write!(f, "i/o error: {e}"),
            DisconnectReason::Malformed(e) => write!(f, "malformed data: {e}"),
            DisconnectReason::ProtocolViolation => f.write_str("protocol violation"),
            DisconnectReason::ServerStopped => f.write_str("server stopped"),
        }
    }
}

/// Receiver for everything a channel's I/O tasks observe.
///
/// Implementations are called from tokio worker threads and must only hand
/// the work off, never act on it in place.
pub trait InboundSink: Send + Sync + 'static {
    /// A complete packet arrived
    fn on_packet(&self, transport: Transport, packet: Packet);

    /// The channel stopped for a reason other than a local `disconnect`
    fn on_closed(&self, reason: DisconnectReason);

    /// An outbound stream connection was established to `peer`
    fn on_open(&self, _peer: SocketAddr) {}
}
