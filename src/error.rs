use std::{io, os::fd::RawFd};

use thiserror::Error;

/// Errors returned by socket operations.
///
/// Nothing here is raised by the manager thread itself: failures it sees are
/// contained there and only become visible as the affected socket being
/// invalidated.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The socket has been invalidated.
    #[error("socket is not valid")]
    Invalid,

    /// A negative or otherwise unusable native handle was passed in.
    #[error("native handle {0} is not usable")]
    InvalidHandle(RawFd),

    /// An address was empty or too short to hold an address family.
    #[error("address is empty or malformed")]
    InvalidAddress,

    /// The operation did not complete within its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The native handle table reached its configured capacity.
    #[error("native handle table is full ({limit} sockets)")]
    TableFull { limit: usize },

    /// The manager configuration can only be changed before it starts.
    #[error("socket manager is already running")]
    AlreadyStarted,

    /// The manager thread or its multiplexer could not be created.
    #[error("socket manager could not start: {source}")]
    ManagerStart {
        #[source]
        source: io::Error,
    },

    /// An operating system error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SocketError {
    /// The OS error code behind this error, if there is one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            SocketError::Io { source } | SocketError::ManagerStart { source } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

pub type Result<T, E = SocketError> = std::result::Result<T, E>;
