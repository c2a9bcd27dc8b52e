use std::io;

use mio::{Registry, Token, Waker};
use tracing::{trace, warn};

/// Token the wakeup channel is registered under. Socket tokens are their
/// descriptor values, which never reach this.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Interrupts the manager's blocking wait. Carries no payload; the manager
/// recomputes its wait bound and readiness on every iteration anyway.
pub(crate) struct WakeupChannel {
    waker: Waker,
}

impl WakeupChannel {
    pub fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            waker: Waker::new(registry, WAKE_TOKEN)?,
        })
    }

    pub fn wake(&self, reason: &'static str) {
        trace!(reason, "waking socket manager");
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, reason, "failed to wake socket manager");
        }
    }
}
