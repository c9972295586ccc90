//! Fixed-interval driver for hosts that have no frame loop of their own.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use netplay_engine::utils::TickDriver;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(mut server: netplay_engine::service::server::Server) {
//! let driver = TickDriver::new(Duration::from_millis(16)).unwrap();
//! let stop = CancellationToken::new();
//! driver
//!     .run(&stop, || {
//!         for event in server.pump() {
//!             println!("{event:?}");
//!         }
//!         true
//!     })
//!     .await;
//! # }
//! ```

use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{NetError, Result};

/// Calls a tick closure at a caller-chosen cadence
#[derive(Debug, Clone, Copy)]
pub struct TickDriver {
    period: Duration,
}

impl TickDriver {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(NetError::ConfigError("Tick period must be non-zero".into()));
        }
        Ok(Self { period })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run `tick` once per period until it returns `false` or `stop` fires.
    ///
    /// Late ticks are skipped rather than bunched up. Returns the number of
    /// ticks run.
    pub async fn run<F>(&self, stop: &CancellationToken, mut tick: F) -> u64
    where
        F: FnMut() -> bool,
    {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return ticks,
                _ = interval.tick() => {
                    ticks += 1;
                    if !tick() {
                        return ticks;
                    }
                }
            }
        }
    }
}
