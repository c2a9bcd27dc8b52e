//! Read-side accumulation for byte-stream sockets.
//!
//! The manager fills the buffer from the socket until it holds the requested
//! number of bytes, the stream ends, or the buffer timeout passes; only then is
//! the client told the socket is readable. Client reads drain leftover bytes
//! first, then the buffer, then fall through to the socket itself.

use std::{
    io,
    time::{Duration, Instant},
};

use tracing::trace;

/// What the manager does with a socket after a read dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    /// Nothing for the client yet; put the socket back in the read set.
    Rearm,
    /// Tell the client the socket is readable.
    Signal,
}

/// The part of the buffer state the manager needs to bound its wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReadTimer {
    pub deadline: Option<Instant>,
}

impl ReadTimer {
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    /// Zero when no timeout is requested.
    timeout: Duration,
    /// Length is the requested byte count; empty when not buffering.
    buf: Vec<u8>,
    filled: usize,
    consumed: usize,
    at_eof: bool,
    /// Sticky error code, replayed by every read once recorded.
    error: Option<i32>,
    /// Bytes that were buffered when the buffer length changed.
    leftover: Vec<u8>,
    notify_at: Option<Instant>,
}

impl ReadBuffer {
    pub fn is_buffering(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Bytes a read can return without touching the socket.
    pub fn available(&self) -> usize {
        self.leftover.len() + (self.filled - self.consumed)
    }

    /// Changes the buffer length and timeout. A length of zero turns
    /// buffering off. Bytes buffered but not yet read survive as leftovers.
    ///
    /// Returns whether the manager's wait bound may have changed.
    pub fn set_attrs(&mut self, timeout: Duration, length: usize) -> bool {
        let mut timeout = timeout;
        if self.buf.len() != length {
            let unread = &self.buf[self.consumed..self.filled];
            if !unread.is_empty() {
                trace!(
                    bytes = unread.len(),
                    leftover = self.leftover.len(),
                    "read buffer resized with unread bytes"
                );
                self.leftover.extend_from_slice(unread);
            }
            self.buf = vec![0; length];
            self.filled = 0;
            self.consumed = 0;
            if length == 0 {
                timeout = Duration::ZERO;
            }
        }
        let changed = self.timeout != timeout;
        self.timeout = timeout;
        changed || !self.leftover.is_empty()
    }

    /// Serves a client read. `direct` reads from the socket and is only called
    /// when nothing is buffered, no error is recorded and the stream has not
    /// ended.
    pub fn read(
        &mut self,
        out: &mut [u8],
        direct: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    ) -> io::Result<usize> {
        if !self.leftover.is_empty() {
            let n = out.len().min(self.leftover.len());
            out[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }

        if self.is_buffering() && self.filled > self.consumed {
            let n = out.len().min(self.filled - self.consumed);
            out[..n].copy_from_slice(&self.buf[self.consumed..self.consumed + n]);
            self.consumed += n;
            if self.consumed == self.filled {
                trace!("read buffer drained");
                self.filled = 0;
                self.consumed = 0;
            }
            return Ok(n);
        }

        if let Some(code) = self.error {
            return Err(io::Error::from_raw_os_error(code));
        }
        if self.at_eof || out.is_empty() {
            return Ok(0);
        }

        match direct(out) {
            Ok(0) => {
                self.at_eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                if !is_transient(&e) {
                    self.error = e.raw_os_error();
                }
                Err(e)
            }
        }
    }

    /// Readiness dispatch: pulls what the socket has into the free part of
    /// the buffer.
    pub fn fill(
        &mut self,
        now: Instant,
        reader: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    ) -> Fill {
        if !self.is_buffering() || self.at_eof || self.filled == self.buf.len() {
            return Fill::Signal;
        }

        match reader(&mut self.buf[self.filled..]) {
            Err(e) if is_transient(&e) => Fill::Rearm,
            Err(e) => {
                trace!(error = %e, "buffered read failed");
                self.error = e.raw_os_error().or(Some(nix::libc::EIO));
                self.at_eof = true;
                Fill::Signal
            }
            Ok(0) => {
                trace!("buffered read reached end of stream");
                self.at_eof = true;
                Fill::Signal
            }
            Ok(n) => {
                self.filled += n;
                if self.filled < self.buf.len() {
                    self.notify_at = Some(now + self.timeout);
                    trace!(need = self.buf.len() - self.filled, "buffering more");
                    Fill::Rearm
                } else {
                    self.notify_at = None;
                    Fill::Signal
                }
            }
        }
    }

    /// Timeout dispatch: signals whatever is buffered, or goes quiet if there
    /// is nothing.
    pub fn on_timeout(&mut self) -> Fill {
        self.notify_at = None;
        if self.filled == 0 && self.leftover.is_empty() {
            Fill::Rearm
        } else {
            Fill::Signal
        }
    }

    pub fn timer(&self, now: Instant) -> ReadTimer {
        let deadline = if !self.leftover.is_empty() {
            Some(now)
        } else if self.timeout.is_zero() {
            None
        } else {
            self.notify_at
        };
        ReadTimer { deadline }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
