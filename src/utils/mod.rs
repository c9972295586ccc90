//! # Utility Modules
//!
//! Supporting pieces used by the service layer and offered to hosts.
//!
//! ## Components
//! - **Main thread queue**: hands I/O results to the thread that owns engine state
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: structured logging setup for hosts
//! - **Tick**: fixed-interval driver for `pump`

pub mod logging;
pub mod main_thread;
pub mod metrics;
pub mod tick;

pub use main_thread::MainThreadQueue;
pub use tick::TickDriver;
