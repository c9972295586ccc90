//! # Protocol Layer
//!
//! Message routing and the identity handshake.
//!
//! - [`dispatcher`]: `HandlerRegistry`, the message-id to handler table
//! - [`handshake`]: welcome and identity packets plus the id-0 handlers both
//!   sides register at construction

pub mod dispatcher;
pub mod handshake;
