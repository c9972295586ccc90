//! # Service Layer
//!
//! The two host-facing entry points and the session bookkeeping behind them.
//!
//! - [`server::Server`]: accepts connections and owns the [`session::SessionTable`]
//! - [`client::PeerConnection`]: one connection to one server
//!
//! Both are plain values owned by the host application. Nothing here is global;
//! a process may run several servers or clients side by side.

pub mod client;
pub mod server;
pub mod session;
