//! Socket manager configuration

use std::str::FromStr;

/// Configuration of the process-wide socket manager.
///
/// Install one with [`configure`](crate::configure) before the first socket is
/// opened; otherwise the manager starts with [`ManagerConfig::from_env`].
#[derive(Educe, Clone, PartialEq, Eq)]
#[educe(Debug, Default)]
pub struct ManagerConfig {
    /// Name of the manager thread
    #[educe(Default = "sockmux-manager")]
    pub thread_name: String,

    /// Maximum number of live sockets in the native handle table
    #[educe(Default = 65536)]
    pub max_sockets: usize,

    /// Readiness events fetched per wait
    #[educe(Default = 128)]
    pub events_capacity: usize,

    /// Largest datagram received in one call on a connectionless socket
    #[educe(Default = 65535)]
    pub max_datagram_size: usize,

    /// Largest chunk received in one call on a connection-oriented socket
    #[educe(Default = 32768)]
    pub max_stream_chunk: usize,

    /// Backlog passed to `listen` after a successful bind
    #[educe(Default = 256)]
    pub listen_backlog: i32,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by any `SOCKMUX_*` environment variables that parse.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            thread_name: env_get("SOCKMUX_THREAD_NAME", default.thread_name),
            max_sockets: env_get("SOCKMUX_MAX_SOCKETS", default.max_sockets),
            events_capacity: env_get("SOCKMUX_EVENTS", default.events_capacity),
            max_datagram_size: env_get("SOCKMUX_MAX_DATAGRAM", default.max_datagram_size),
            max_stream_chunk: env_get("SOCKMUX_MAX_STREAM_CHUNK", default.max_stream_chunk),
            listen_backlog: env_get("SOCKMUX_LISTEN_BACKLOG", default.listen_backlog),
        }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn max_sockets(mut self, n: usize) -> Self {
        self.max_sockets = n;
        self
    }

    pub fn events_capacity(mut self, n: usize) -> Self {
        self.events_capacity = n;
        self
    }

    pub fn max_datagram_size(mut self, n: usize) -> Self {
        self.max_datagram_size = n;
        self
    }

    pub fn max_stream_chunk(mut self, n: usize) -> Self {
        self.max_stream_chunk = n;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_sockets == 0 {
            return Err("max_sockets must be at least 1");
        }
        if self.events_capacity == 0 {
            return Err("events_capacity must be at least 1");
        }
        if self.max_datagram_size == 0 || self.max_stream_chunk == 0 {
            return Err("receive sizes must be at least 1");
        }
        if self.listen_backlog < 0 {
            return Err("listen_backlog must not be negative");
        }
        Ok(())
    }
}

fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
