//! The socket manager: one background thread that waits for readiness on
//! every armed socket, performs the transfer syscalls and signals the sockets'
//! event sources.

pub(crate) mod readiness;
pub(crate) mod wakeup;

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use mio::{Events, Poll};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ManagerConfig,
    error::{Result, SocketError},
    socket::SocketShared,
    sys,
    table::HandleTable,
};
use readiness::ReadinessSets;
use wakeup::WakeupChannel;

static MANAGER: OnceCell<Manager> = OnceCell::new();
static PENDING_CONFIG: Mutex<Option<ManagerConfig>> = parking_lot::const_mutex(None);

pub(crate) struct Manager {
    pub config: ManagerConfig,
    /// Outermost lock: native handle to socket.
    pub table: Mutex<HandleTable>,
    /// Innermost shared lock, taken after a socket's own lock.
    pub active: Mutex<ReadinessSets<Arc<SocketShared>>>,
    wakeup: WakeupChannel,
    /// Handed to the manager thread when it starts.
    poll: Mutex<Option<Poll>>,
    running: AtomicBool,
    iteration: AtomicU64,
}

/// Installs the configuration the manager starts with.
pub(crate) fn configure(config: ManagerConfig) -> Result<()> {
    if MANAGER.get().is_some() {
        return Err(SocketError::AlreadyStarted);
    }
    *PENDING_CONFIG.lock() = Some(config);
    Ok(())
}

/// The process-wide manager, started on first use.
pub(crate) fn manager() -> Result<&'static Manager> {
    let manager = MANAGER.get_or_try_init(|| {
        let config = PENDING_CONFIG
            .lock()
            .take()
            .unwrap_or_else(ManagerConfig::from_env);
        let config = match config.validate() {
            Ok(()) => config,
            Err(reason) => {
                warn!(reason, "invalid socket manager configuration; using defaults");
                ManagerConfig::default()
            }
        };
        Manager::new(config).map_err(|source| {
            error!(error = %source, "failed to create socket manager");
            SocketError::ManagerStart { source }
        })
    })?;
    manager.start()?;
    Ok(manager)
}

impl Manager {
    fn new(config: ManagerConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let wakeup = WakeupChannel::new(poll.registry())?;
        Ok(Self {
            table: Mutex::new(HandleTable::new(config.max_sockets)),
            active: Mutex::new(ReadinessSets::new(registry)),
            wakeup,
            poll: Mutex::new(Some(poll)),
            running: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            config,
        })
    }

    fn start(&'static self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let slot = self.poll.lock();
        if slot.is_none() || self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        // the thread takes the poller once this lock is released, so a failed
        // spawn leaves it in place for the next attempt
        thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                if let Some(poll) = self.poll.lock().take() {
                    self.run(poll);
                }
            })
            .map_err(|source| {
                error!(error = %source, "failed to spawn socket manager thread");
                SocketError::ManagerStart { source }
            })?;
        self.running.store(true, Ordering::Release);
        info!(thread = %self.config.thread_name, "socket manager started");
        drop(slot);
        Ok(())
    }

    pub fn wake(&self, reason: &'static str) {
        self.wakeup.wake(reason);
    }

    /// Number of completed waits.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    fn run(&self, mut poll: Poll) {
        let mut events = Events::with_capacity(self.config.events_capacity);
        loop {
            let (fault, timeout) = {
                let mut active = self.active.lock();
                (active.take_fault(), active.next_timeout(Instant::now()))
            };
            if fault {
                self.sweep_invalid();
                continue;
            }

            let iteration = self.iteration.load(Ordering::Relaxed) + 1;
            trace!(iteration, ?timeout, "waiting for readiness");
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(iteration, error = %e, "readiness wait failed");
                if e.raw_os_error() == Some(nix::libc::EBADF) {
                    self.sweep_invalid();
                }
                continue;
            }
            self.iteration.store(iteration, Ordering::Relaxed);

            let selected = self.active.lock().select(&events, Instant::now());
            if !selected.writes.is_empty() || !selected.reads.is_empty() {
                debug!(
                    iteration,
                    writes = selected.writes.len(),
                    reads = selected.reads.len(),
                    "dispatching"
                );
            }
            for socket in selected.writes {
                socket.handle_write();
            }
            for (socket, by_timeout) in selected.reads {
                socket.handle_read(by_timeout);
            }
        }
    }

    /// Invalidates every watched socket whose descriptor was closed behind its
    /// back.
    fn sweep_invalid(&self) {
        let invalid = self.active.lock().sweep(sys::is_valid_descriptor);
        if !invalid.is_empty() {
            warn!(count = invalid.len(), "invalidating sockets with closed descriptors");
        }
        for socket in invalid {
            socket.invalidate_closed();
        }
    }
}
