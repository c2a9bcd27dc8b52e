//! A blocking scheduler context: the thread that calls [`RunLoop::run_once`]
//! performs the sources signalled to it.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    error::Result,
    socket::Socket,
    source::{EventSource, Registration, SchedulerContext},
};

enum Message {
    Perform(Arc<EventSource>),
    Wake,
    Stop,
}

struct Inner {
    sender: Sender<Message>,
    waiting: AtomicBool,
}

impl Inner {
    fn send(&self, message: Message) {
        // the receiver lives as long as the run loop that owns this sender
        let _ = self.sender.send(message);
    }
}

impl SchedulerContext for Inner {
    fn signal(&self, source: &Arc<EventSource>) {
        self.send(Message::Perform(source.clone()));
    }

    fn wake(&self) {
        self.send(Message::Wake);
    }

    fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }
}

/// Lets other threads stop or wake a [`RunLoop`].
#[derive(Clone)]
pub struct RunLoopHandle {
    inner: Arc<Inner>,
}

impl RunLoopHandle {
    /// Makes the run loop's current or next `run_once` return `Break`.
    pub fn stop(&self) {
        self.inner.send(Message::Stop);
    }

    pub fn wake(&self) {
        self.inner.send(Message::Wake);
    }
}

/// Event sources stay scheduled on the run loop until removed or until the
/// run loop is dropped.
pub struct RunLoop {
    inner: Arc<Inner>,
    receiver: Receiver<Message>,
    registrations: Mutex<Vec<Registration>>,
}

impl Default for RunLoop {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(Inner {
                sender,
                waiting: AtomicBool::new(false),
            }),
            receiver,
            registrations: Mutex::new(Vec::new()),
        }
    }
}

impl RunLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> RunLoopHandle {
        RunLoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// The run loop as a bare scheduler context, for scheduling sources by
    /// hand.
    pub fn context(&self) -> Arc<dyn SchedulerContext> {
        self.inner.clone()
    }

    pub fn add_source(&self, source: &Arc<EventSource>) -> Result<()> {
        self.release_invalid();
        let registration = source.schedule(self.context())?;
        self.registrations.lock().push(registration);
        Ok(())
    }

    /// Drops the registrations of sources whose socket was invalidated.
    fn release_invalid(&self) {
        let released: Vec<_> = {
            let mut registrations = self.registrations.lock();
            let (valid, released) = registrations
                .drain(..)
                .partition(|r| r.source().is_valid());
            *registrations = valid;
            released
        };
        if !released.is_empty() {
            trace!(count = released.len(), "released invalidated sources");
        }
    }

    /// Schedules the socket's event source, creating it if needed.
    pub fn add_socket(&self, socket: &Socket) -> Result<()> {
        self.add_source(&socket.create_event_source()?)
    }

    /// Unschedules `source`. Does nothing if it was never added.
    pub fn remove_source(&self, source: &Arc<EventSource>) {
        let removed: Vec<_> = {
            let mut registrations = self.registrations.lock();
            let (removed, kept) = registrations
                .drain(..)
                .partition(|r| Arc::ptr_eq(r.source(), source));
            *registrations = kept;
            removed
        };
        // cancelling takes socket locks; do it outside ours
        drop(removed);
    }

    /// Waits up to `timeout` (forever if `None`) for signals, then performs
    /// everything queued at that point.
    ///
    /// Returns the number of sources that delivered events, or `Break` once
    /// stopped.
    pub fn run_once(&self, timeout: Option<Duration>) -> ControlFlow<(), usize> {
        self.inner.waiting.store(true, Ordering::Release);
        let first = match timeout {
            None => self.receiver.recv().ok(),
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.inner.waiting.store(false, Ordering::Release);
                    return ControlFlow::Break(());
                }
            },
        };
        self.inner.waiting.store(false, Ordering::Release);

        // callbacks can signal again; those wait for the next round
        let pending: Vec<_> = first.into_iter().chain(self.receiver.try_iter()).collect();
        let mut performed = 0;
        for message in pending {
            match message {
                Message::Perform(source) => {
                    if source.perform() {
                        performed += 1;
                    }
                }
                Message::Wake => {
                    trace!("run loop woken");
                    self.release_invalid();
                }
                Message::Stop => return ControlFlow::Break(()),
            }
        }
        ControlFlow::Continue(performed)
    }

    /// Runs until `deadline` passes or the loop is stopped.
    pub fn run_until(&self, deadline: Instant) -> ControlFlow<()> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return ControlFlow::Continue(());
            }
            self.run_once(Some(deadline - now))?;
        }
    }

    /// Runs until `done` returns true, checking after every round, or until
    /// `deadline`. Returns whether `done` was satisfied.
    pub fn run_while(&self, deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            if self.run_once(Some(wait)).is_break() {
                return done();
            }
        }
    }

    /// Runs until stopped.
    pub fn run(&self) {
        while self.run_once(None).is_continue() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_breaks_the_loop() {
        let run_loop = RunLoop::new();
        let handle = run_loop.handle();
        handle.wake();
        assert_eq!(run_loop.run_once(Some(Duration::ZERO)), ControlFlow::Continue(0));

        handle.stop();
        assert_eq!(run_loop.run_once(None), ControlFlow::Break(()));
    }

    #[test]
    fn invalidated_sockets_are_released() {
        use std::os::{fd::IntoRawFd, unix::net::UnixStream};

        use crate::types::CallbackTypes;

        let run_loop = RunLoop::new();
        let mut peers = Vec::new();
        for _ in 0..16 {
            let (a, b) = UnixStream::pair().unwrap();
            let socket = Socket::open(a.into_raw_fd(), CallbackTypes::DATA, |_, _| {}).unwrap();
            run_loop.add_socket(&socket).unwrap();
            socket.invalidate();
            peers.push(b);
        }
        assert!(run_loop.run_once(Some(Duration::ZERO)).is_continue());
        assert!(run_loop.registrations.lock().is_empty());
    }

    #[test]
    fn reports_waiting_only_while_blocked() {
        let run_loop = RunLoop::new();
        let context = run_loop.context();
        assert!(!context.is_waiting());

        let handle = run_loop.handle();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });
        assert!(run_loop.run_until(Instant::now() + Duration::from_secs(10)).is_break());
        assert!(!context.is_waiting());
        waker.join().unwrap();
    }
}
