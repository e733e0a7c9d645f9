//! Tick-driven deferred reclamation.
//!
//! Workers queue callbacks which must not run until every worker has passed a quiescent point. A single
//! orchestrator, driven at a fixed rate by a [`Ticker`], ends batches once every worker consents and runs whatever the
//! batch before retired.
//!
//! ```no_run
//! use tickrcu::{Config, Engine};
//!
//! let engine = Engine::new(Config::default())?;
//! let _ticker = engine.start()?;
//!
//! let worker = engine.register()?;
//! worker.submit(|| println!("nobody can see the old value any more"));
//! worker.barrier();
//! # Ok::<(), tickrcu::RcuError>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod rcu;
pub mod stats;

#[cfg(not(loom))]
pub mod driver;
#[cfg(not(loom))]
pub mod global;

pub use clock::{Clock, ManualClock};
pub use config::{Config, DriverMode, TickRate, Tunables};
pub use error::{ConfigError, RcuError, Result};
pub use mem::CallbackNode;
pub use rcu::{Engine, ReadGuard, TickOutcome, Worker};
pub use stats::{Report, StatsSnapshot, WorkerRow};

#[cfg(not(loom))]
pub use driver::{DaemonDriver, ProgressDriver, Ticker, TimerDriver};
