//! Socket event multiplexing.
//!
//! Native sockets are wrapped in [`Socket`]s and watched by one background
//! manager thread. The manager does the reads, accepts and connect checks
//! itself and hands the results to the scheduler contexts (a [`RunLoop`], an
//! [`AsyncContext`], or any [`SchedulerContext`]) each socket's
//! [`EventSource`] is scheduled on, where the socket's callback runs.

#[macro_use]
extern crate educe;

mod async_context;
mod buffer;
mod config;
mod error;
mod reactor;
mod runloop;
mod socket;
mod source;
mod sys;
mod table;
mod types;

pub use async_context::AsyncContext;
pub use config::ManagerConfig;
pub use error::{Result, SocketError};
pub use runloop::{RunLoop, RunLoopHandle};
pub use socket::{Callback, Socket, SocketSignature};
pub use source::{EventSource, Registration, SchedulerContext};
pub use types::{CallbackTypes, ReadKind, SocketEvent, SocketFlags};

/// Sets the configuration the socket manager starts with.
///
/// The manager starts with the first socket created; configuring after that
/// fails with [`SocketError::AlreadyStarted`]. Without a call, the manager
/// reads `SOCKMUX_*` environment variables.
pub fn configure(config: ManagerConfig) -> Result<()> {
    reactor::configure(config)
}

/// Completed waits of the manager thread. Mostly useful for observing that
/// the manager made progress.
pub fn manager_iterations() -> Result<u64> {
    Ok(reactor::manager()?.iteration())
}
