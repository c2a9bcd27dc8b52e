use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    Stream,
};
use pin_project::pin_project;

use crate::{
    error::Result,
    socket::Socket,
    source::{EventSource, Registration, SchedulerContext},
};

enum Wakeup {
    Perform(Arc<EventSource>),
    Wake,
}

struct Signals {
    sender: UnboundedSender<Wakeup>,
    waiting: AtomicBool,
}

impl SchedulerContext for Signals {
    fn signal(&self, source: &Arc<EventSource>) {
        let _ = self.sender.unbounded_send(Wakeup::Perform(source.clone()));
    }

    fn wake(&self) {
        let _ = self.sender.unbounded_send(Wakeup::Wake);
    }

    fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }
}

/// A scheduler context driven by an async task.
///
/// Polling the stream performs signalled sources on the polling task and
/// yields how many of them delivered events. Wakeups without events (such as
/// a scheduled socket being invalidated) yield `0`.
#[pin_project]
pub struct AsyncContext {
    signals: Arc<Signals>,
    registrations: Vec<Registration>,

    #[pin]
    ready: UnboundedReceiver<Wakeup>,
}

impl Default for AsyncContext {
    fn default() -> Self {
        let (sender, ready) = unbounded();
        Self {
            signals: Arc::new(Signals {
                sender,
                waiting: AtomicBool::new(false),
            }),
            registrations: Vec::new(),
            ready,
        }
    }
}

impl AsyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: &Arc<EventSource>) -> Result<()> {
        self.registrations.retain(|r| r.source().is_valid());
        let signals: Arc<dyn SchedulerContext> = self.signals.clone();
        self.registrations.push(source.schedule(signals)?);
        Ok(())
    }

    pub fn add_socket(&mut self, socket: &Socket) -> Result<()> {
        self.add_source(&socket.create_event_source()?)
    }

    pub fn remove_source(&mut self, source: &Arc<EventSource>) {
        self.registrations.retain(|r| !Arc::ptr_eq(r.source(), source));
    }
}

impl Stream for AsyncContext {
    type Item = usize;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<usize>> {
        let mut this = self.project();
        let mut performed = 0;
        let mut woken = false;
        loop {
            match this.ready.as_mut().poll_next(cx) {
                Poll::Ready(Some(Wakeup::Perform(source))) => {
                    woken = true;
                    if source.perform() {
                        performed += 1;
                    }
                }
                Poll::Ready(Some(Wakeup::Wake)) => {
                    woken = true;
                    this.registrations.retain(|r| r.source().is_valid());
                }
                // the sender lives in `signals`, so the channel never closes
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => break,
            }
        }
        this.signals.waiting.store(!woken, Ordering::Release);
        if woken {
            Poll::Ready(Some(performed))
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::{fd::IntoRawFd, unix::net::UnixStream};

    use futures::{executor::block_on, StreamExt};

    use super::*;
    use crate::types::CallbackTypes;

    #[test]
    fn invalidated_sockets_are_released() {
        let mut context = AsyncContext::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let socket = Socket::open(a.into_raw_fd(), CallbackTypes::DATA, |_, _| {}).unwrap();
        context.add_socket(&socket).unwrap();
        assert_eq!(context.registrations.len(), 1);

        socket.invalidate();
        assert_eq!(block_on(context.next()), Some(0));
        assert!(context.registrations.is_empty());
    }
}
