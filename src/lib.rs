//! # netplay-engine
//!
//! Client/server session engine for real-time games, running reliable TCP and
//! best-effort UDP side by side between one server and many short-lived
//! clients.
//!
//! ## Layers
//! - [`core`]: the [`Packet`](core::packet::Packet) buffer and stream framing
//! - [`transport`]: per-connection TCP and UDP channels on tokio
//! - [`protocol`]: handler registry and the id-0 identity handshake
//! - [`service`]: the [`Server`](service::server::Server) and
//!   [`PeerConnection`](service::client::PeerConnection) hosts drive
//! - [`utils`]: main-thread queue, metrics, logging, tick driver
//!
//! ## Threading Model
//! Socket work runs on tokio tasks. Handlers, session state and lifecycle
//! events live on the host's thread and only move when the host calls
//! `pump()`, typically once per frame. No handler ever runs concurrently with
//! another.
//!
//! ## Wire Format
//! ```text
//! TCP:            [len: i32] [message id: i32] [payload...]
//! UDP to server:  [session id: i32] [len: i32] [message id: i32] [payload...]
//! UDP to client:  [len: i32] [message id: i32] [payload...]
//! ```
//! All integers are little-endian. Message id 0 is the handshake.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::Packet;
pub use crate::error::{NetError, Result};
pub use crate::service::client::{ClientEvent, PeerConnection, PeerContext, PeerState};
pub use crate::service::server::{Server, ServerContext, ServerEvent};
pub use crate::service::session::{SessionId, SessionState};
pub use crate::transport::{DisconnectReason, Transport};
