use std::{
    collections::{BTreeMap, HashMap},
    os::fd::RawFd,
    time::{Duration, Instant},
};

use mio::{event::Event, unix::SourceFd, Events, Interest, Registry, Token};
use nix::libc::{EBADF, ENOENT};
use tracing::{debug, trace, warn};

use super::wakeup::WAKE_TOKEN;
use crate::buffer::ReadTimer;

/// Something the manager watches for readiness.
pub(crate) trait Watched: Clone {
    fn read_timer(&self) -> ReadTimer;
}

/// Growable bitmap indexed by descriptor.
#[derive(Debug, Default, Clone)]
pub(crate) struct FdSet {
    words: Vec<u64>,
}

impl FdSet {
    fn split(fd: RawFd) -> (usize, u64) {
        let fd = fd as usize;
        (fd / 64, 1 << (fd % 64))
    }

    /// Sets the bit; returns whether it was clear before.
    pub fn insert(&mut self, fd: RawFd) -> bool {
        let (word, bit) = Self::split(fd);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !was_set
    }

    /// Clears the bit; returns whether it was set before.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let (word, bit) = Self::split(fd);
        match self.words.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        let (word, bit) = Self::split(fd);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..64)
                .filter(move |b| word & (1 << b) != 0)
                .map(move |b| (i * 64 + b) as RawFd)
        })
    }
}

/// Sockets picked by one manager iteration. Writes are dispatched first.
pub(crate) struct Selected<S> {
    pub writes: Vec<S>,
    /// Paired with whether the read was picked because its buffer timed out.
    pub reads: Vec<(S, bool)>,
}

/// The sockets that currently want read or write readiness.
///
/// A socket is in `want_read` exactly when its bit is set in `read_fds` (and
/// likewise for writes), and the kernel registration always mirrors the two
/// bitmaps. Because the multiplexer is edge-triggered, every transition from
/// disarmed to armed re-registers the descriptor so the kernel reports data
/// that is already pending.
pub(crate) struct ReadinessSets<S> {
    registry: Registry,
    want_read: BTreeMap<RawFd, S>,
    want_write: BTreeMap<RawFd, S>,
    read_fds: FdSet,
    write_fds: FdSet,
    registered: HashMap<RawFd, Interest>,
    fault: bool,
}

impl<S: Watched> ReadinessSets<S> {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            want_read: BTreeMap::new(),
            want_write: BTreeMap::new(),
            read_fds: FdSet::default(),
            write_fds: FdSet::default(),
            registered: HashMap::new(),
            fault: false,
        }
    }

    /// Returns whether the socket was not armed for reading before.
    pub fn arm_read(&mut self, fd: RawFd, socket: &S) -> bool {
        if !self.read_fds.insert(fd) {
            return false;
        }
        self.want_read.insert(fd, socket.clone());
        self.sync(fd);
        true
    }

    pub fn arm_write(&mut self, fd: RawFd, socket: &S) -> bool {
        if !self.write_fds.insert(fd) {
            return false;
        }
        self.want_write.insert(fd, socket.clone());
        self.sync(fd);
        true
    }

    pub fn disarm_read(&mut self, fd: RawFd) -> bool {
        if !self.read_fds.remove(fd) {
            return false;
        }
        self.want_read.remove(&fd);
        self.sync(fd);
        true
    }

    pub fn disarm_write(&mut self, fd: RawFd) -> bool {
        if !self.write_fds.remove(fd) {
            return false;
        }
        self.want_write.remove(&fd);
        self.sync(fd);
        true
    }

    pub fn remove(&mut self, fd: RawFd) {
        self.disarm_write(fd);
        self.disarm_read(fd);
    }

    pub fn is_read_armed(&self, fd: RawFd) -> bool {
        self.read_fds.contains(fd)
    }

    pub fn is_write_armed(&self, fd: RawFd) -> bool {
        self.write_fds.contains(fd)
    }

    /// Makes the kernel registration of `fd` match its bits.
    fn sync(&mut self, fd: RawFd) {
        let interest = match (self.read_fds.contains(fd), self.write_fds.contains(fd)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let token = Token(fd as usize);
        let registered = self.registered.contains_key(&fd);

        let res = match interest {
            None if !registered => return,
            None => {
                self.registered.remove(&fd);
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    debug!(fd, error = %e, "deregister failed");
                }
                return;
            }
            Some(interest) if registered => self
                .registry
                .reregister(&mut SourceFd(&fd), token, interest)
                .or_else(|e| match e.raw_os_error() {
                    // descriptor was closed and reused behind our back
                    Some(ENOENT) => self.registry.register(&mut SourceFd(&fd), token, interest),
                    _ => Err(e),
                }),
            Some(interest) => self.registry.register(&mut SourceFd(&fd), token, interest),
        };

        match res {
            Ok(()) => {
                trace!(fd, ?interest, "registration updated");
                if let Some(interest) = interest {
                    self.registered.insert(fd, interest);
                }
            }
            Err(e) => {
                self.registered.remove(&fd);
                if e.raw_os_error() == Some(EBADF) {
                    warn!(fd, "registering a closed descriptor; sweep scheduled");
                    self.fault = true;
                } else {
                    warn!(fd, error = %e, "failed to register descriptor");
                }
            }
        }
    }

    /// How long the manager may wait before some buffered read times out.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.want_read
            .values()
            .filter_map(|s| s.read_timer().deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Picks the sockets reported ready in `events` plus the armed readers
    /// whose buffer timeout has passed, disarming each one picked.
    pub fn select(&mut self, events: &Events, now: Instant) -> Selected<S> {
        let mut writes = Vec::new();
        let mut reads = Vec::new();

        for event in events.iter().filter(|e| e.token() != WAKE_TOKEN) {
            let fd = event.token().0 as RawFd;
            if wants_write(event) {
                if let Some(socket) = self.want_write.get(&fd).cloned() {
                    self.disarm_write(fd);
                    writes.push(socket);
                }
            }
            if wants_read(event) {
                if let Some(socket) = self.want_read.get(&fd).cloned() {
                    self.disarm_read(fd);
                    reads.push((socket, false));
                }
            }
        }

        let expired: Vec<RawFd> = self
            .want_read
            .iter()
            .filter(|(_, s)| s.read_timer().is_due(now))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in expired {
            if let Some(socket) = self.want_read.get(&fd).cloned() {
                trace!(fd, "read buffer timed out");
                self.disarm_read(fd);
                reads.push((socket, true));
            }
        }

        Selected { writes, reads }
    }

    pub fn is_faulted(&self) -> bool {
        self.fault
    }

    pub fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.fault)
    }

    /// Finds the watched sockets whose descriptor is no longer open. When there
    /// are none, stale bits for closed descriptors are cleared instead.
    pub fn sweep(&mut self, is_valid: impl Fn(RawFd) -> bool) -> Vec<S> {
        let mut invalid: Vec<(RawFd, S)> = Vec::new();
        for (fd, socket) in self.want_write.iter().chain(self.want_read.iter()) {
            if !is_valid(*fd) && !invalid.iter().any(|(seen, _)| seen == fd) {
                invalid.push((*fd, socket.clone()));
            }
        }

        if invalid.is_empty() {
            let stale: Vec<RawFd> = self
                .read_fds
                .iter()
                .chain(self.write_fds.iter())
                .chain(self.registered.keys().copied())
                .filter(|&fd| !is_valid(fd))
                .collect();
            debug!(count = stale.len(), "no invalid sockets found; clearing stale descriptors");
            for fd in stale {
                self.read_fds.remove(fd);
                self.write_fds.remove(fd);
                self.want_read.remove(&fd);
                self.want_write.remove(&fd);
                self.registered.remove(&fd);
            }
        }

        invalid.into_iter().map(|(_, s)| s).collect()
    }

    #[cfg(test)]
    pub fn read_len(&self) -> usize {
        self.want_read.len()
    }
}

fn wants_write(event: &Event) -> bool {
    event.is_writable() || event.is_write_closed() || event.is_error()
}

fn wants_read(event: &Event) -> bool {
    event.is_readable() || event.is_read_closed() || event.is_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use parking_lot::Mutex;
    use std::{
        io::Write,
        os::{fd::AsRawFd, unix::net::UnixStream},
        sync::Arc,
    };

    #[derive(Clone, Default)]
    struct Fake(Arc<Mutex<ReadTimer>>);

    impl Watched for Fake {
        fn read_timer(&self) -> ReadTimer {
            *self.0.lock()
        }
    }

    fn sets() -> (Poll, ReadinessSets<Fake>) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        (poll, ReadinessSets::new(registry))
    }

    #[test]
    fn fd_set_grows_and_reports_changes() {
        let mut set = FdSet::default();
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(200));
        assert!(set.contains(200));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 200]);
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(4000));
    }

    #[test]
    fn bits_and_members_stay_in_step() {
        let (_poll, mut sets) = sets();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let fake = Fake::default();

        assert!(sets.arm_read(fd, &fake));
        assert!(!sets.arm_read(fd, &fake));
        assert!(sets.arm_write(fd, &fake));
        assert_eq!(sets.read_len(), 1);

        sets.remove(fd);
        assert!(!sets.is_read_armed(fd));
        assert!(!sets.is_write_armed(fd));
        assert_eq!(sets.read_len(), 0);
        assert!(sets.registered.is_empty());
    }

    #[test]
    fn pending_data_is_reported_after_rearm() {
        let (mut poll, mut sets) = sets();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let fake = Fake::default();
        let mut events = Events::with_capacity(8);

        b.write_all(b"ping").unwrap();
        sets.arm_read(fd, &fake);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let selected = sets.select(&events, Instant::now());
        assert_eq!(selected.reads.len(), 1);
        assert!(!sets.is_read_armed(fd));

        // nothing was read, so arming again must report it again
        sets.arm_read(fd, &fake);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let selected = sets.select(&events, Instant::now());
        assert_eq!(selected.reads.len(), 1);
        assert!(!selected.reads[0].1);
    }

    #[test]
    fn expired_buffers_bound_the_wait_and_get_selected() {
        let (_poll, mut sets) = sets();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let now = Instant::now();
        let fake = Fake::default();
        *fake.0.lock() = ReadTimer {
            deadline: Some(now + Duration::from_millis(50)),
        };

        sets.arm_read(fd, &fake);
        assert_eq!(sets.next_timeout(now), Some(Duration::from_millis(50)));

        let events = Events::with_capacity(1);
        assert!(sets.select(&events, now).reads.is_empty());

        let later = now + Duration::from_millis(60);
        assert_eq!(sets.next_timeout(later), Some(Duration::ZERO));
        let selected = sets.select(&events, later);
        assert_eq!(selected.reads.len(), 1);
        assert!(selected.reads[0].1);
        assert_eq!(sets.next_timeout(later), None);
    }

    #[test]
    fn sweep_reports_closed_descriptors() {
        let (_poll, mut sets) = sets();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        sets.arm_write(fd, &Fake::default());

        assert!(sets.sweep(|_| true).is_empty());
        assert_eq!(sets.sweep(|candidate| candidate != fd).len(), 1);
    }
}
