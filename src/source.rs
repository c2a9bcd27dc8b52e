//! Bridges a socket's events to the scheduler contexts that deliver them.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tracing::trace;

use crate::{
    error::{Result, SocketError},
    socket::{Socket, SocketShared},
};

/// A client execution context (an event loop, a thread, an async task) that
/// socket callbacks run on.
pub trait SchedulerContext: Send + Sync {
    /// Queues `source` for a [`EventSource::perform`] on this context's thread
    /// and wakes the context.
    fn signal(&self, source: &Arc<EventSource>);

    /// Interrupts the context's wait without queueing anything.
    fn wake(&self);

    /// The context is idle, blocked waiting for work.
    fn is_waiting(&self) -> bool;
}

pub(crate) type Context = Arc<dyn SchedulerContext>;

pub(crate) fn same_context(a: &Context, b: &Context) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Picks the one context to wake for a signal.
///
/// If every entry is the same context it is chosen. Otherwise the first
/// waiting context wins, falling back to the first entry, and the chosen one
/// moves to the back of the list so repeated signals rotate through busy
/// contexts.
pub(crate) fn pick_context(contexts: &mut Vec<Context>) -> Option<Context> {
    let first = contexts.first()?.clone();
    if contexts.iter().all(|c| same_context(c, &first)) {
        return Some(first);
    }
    let idx = contexts.iter().position(|c| c.is_waiting()).unwrap_or(0);
    let chosen = contexts.remove(idx);
    contexts.push(chosen.clone());
    Some(chosen)
}

/// The handle scheduler contexts hold for a socket.
///
/// A socket has at most one event source. Signals raised while no context
/// has the source scheduled stay pending until one schedules it.
pub struct EventSource {
    socket: Weak<SocketShared>,
    signalled: AtomicBool,
    valid: AtomicBool,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("signalled", &self.signalled.load(Ordering::Relaxed))
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventSource {
    pub(crate) fn new(socket: &Arc<SocketShared>) -> Arc<Self> {
        Arc::new(Self {
            socket: Arc::downgrade(socket),
            signalled: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        })
    }

    /// The socket this source delivers for, while it is alive.
    pub fn socket(&self) -> Option<Socket> {
        self.socket.upgrade().map(Socket::from_shared)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Adds `context` to the contexts this source delivers through. The
    /// first schedule arms the socket in the manager.
    ///
    /// The source stays scheduled until the returned registration is dropped.
    pub fn schedule(self: &Arc<Self>, context: Arc<dyn SchedulerContext>) -> Result<Registration> {
        let shared = self.socket.upgrade().ok_or(SocketError::Invalid)?;
        if !self.is_valid() {
            return Err(SocketError::Invalid);
        }
        shared.schedule(context.clone())?;
        if self.is_signalled() {
            trace!("delivering pending signal to new context");
            context.signal(self);
        }
        Ok(Registration {
            source: self.clone(),
            context,
        })
    }

    fn cancel(&self, context: &Context) {
        if let Some(shared) = self.socket.upgrade() {
            shared.cancel(context);
        }
    }

    /// Runs the socket's callbacks for the pending signal, if any. Called by a
    /// scheduler context on its own thread.
    ///
    /// Returns whether a signal was consumed.
    pub fn perform(&self) -> bool {
        if !self.is_valid() || !self.signalled.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.socket.upgrade() {
            Some(shared) => {
                shared.perform();
                true
            }
            None => false,
        }
    }

    /// Marks the source signalled and hands it to `context`.
    pub(crate) fn signal(self: &Arc<Self>, context: Option<Context>) {
        if !self.is_valid() {
            return;
        }
        self.signalled.store(true, Ordering::Release);
        if let Some(context) = context {
            context.signal(self);
        }
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.signalled.store(false, Ordering::Release);
    }
}

/// Keeps an event source scheduled on one context; dropping it cancels.
#[must_use = "dropping a registration unschedules the source"]
pub struct Registration {
    source: Arc<EventSource>,
    context: Context,
}

impl Registration {
    pub fn source(&self) -> &Arc<EventSource> {
        &self.source
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.source.cancel(&self.context);
    }
}
