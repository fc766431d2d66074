//! Zero-downtime restarts for servers with a single listening socket.
//!
//! A running server hands its listener to a freshly started copy of its own
//! binary, waits for that copy to confirm it is serving, and only then stops.
//! The socket is never closed, so no connection is refused along the way.
//!
//! ```no_run
//! use reborn::{Coordinator, Handoff, Strategy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handoff = Handoff::from_env(Strategy::Single)?;
//! let listener = handoff.listener_or_bind("tcp:127.0.0.1:8080")?;
//! let mut coordinator = Coordinator::builder(handoff)
//!     .on_reload(|_| Ok(()))
//!     .build()?;
//!
//! // ... start serving `listener` on other threads ...
//!
//! if coordinator.spawner().is_successor() {
//!     coordinator.spawner().kill()?;
//! }
//! let signal = coordinator.wait(&listener)?;
//! # let _ = signal;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod envelope;
mod error;
mod handoff;
mod kill;
pub mod listener;
mod spawn;
pub mod strategy;

pub use config::RestartConfig;
pub use coordinator::{Coordinator, Event, EventQueue, HookResult, State};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use handoff::Handoff;
pub use listener::{is_closing, Listener, Network};
pub use spawn::{current_executable, Reexec};
pub use strategy::Strategy;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
