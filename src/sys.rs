//! Thin wrappers over the socket syscalls the manager and sockets issue on raw
//! descriptors they do not own as Rust values.

use std::{
    io,
    os::fd::{BorrowedFd, IntoRawFd, OwnedFd, RawFd},
    time::Duration,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
};
use socket2::{Domain, Protocol, SockAddr, SockRef, Type};
use tracing::{debug, warn};

nix::ioctl_read_bad!(fionread, nix::libc::FIONREAD, nix::libc::c_int);

fn with_sockref<R>(fd: RawFd, f: impl FnOnce(SockRef<'_>) -> R) -> R {
    // SAFETY: callers only pass descriptors they keep open for the duration of
    // the call; the borrow does not outlive `f`.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    f(SockRef::from(&borrowed))
}

/// Creates a new socket and hands its descriptor to the caller.
pub(crate) fn socket(domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<RawFd> {
    Ok(socket2::Socket::new(domain, ty, protocol)?.into_raw_fd())
}

pub(crate) fn socket_type(fd: RawFd) -> io::Result<Type> {
    with_sockref(fd, |s| s.r#type())
}

/// Descriptor is still open as far as the kernel knows.
pub(crate) fn is_valid_descriptor(fd: RawFd) -> bool {
    !matches!(fcntl(fd, FcntlArg::F_GETFL), Err(Errno::EBADF))
}

pub(crate) fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    Ok(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK))
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    with_sockref(fd, |s| s.set_nonblocking(nonblocking))
}

/// Receives up to `max` bytes along with the sender's address.
pub(crate) fn recv_from(fd: RawFd, max: usize) -> io::Result<(Vec<u8>, Option<SockAddr>)> {
    let mut buf = Vec::with_capacity(max);
    let (n, addr) = with_sockref(fd, |s| s.recv_from(buf.spare_capacity_mut()))?;
    // SAFETY: recv_from initialised the first `n` bytes of the spare capacity.
    unsafe { buf.set_len(n) };
    buf.shrink_to_fit();
    // connected stream sockets report an unnamed sender
    let addr = (addr.len() > 0 && addr.family() != 0).then_some(addr);
    Ok((buf, addr))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match nix::unistd::read(fd, buf) {
            Err(Errno::EINTR) => continue,
            res => return res.map_err(io::Error::from),
        }
    }
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SockAddr)> {
    let (socket, addr) = with_sockref(fd, |s| s.accept())?;
    Ok((OwnedFd::from(socket), addr))
}

/// Fetches and clears the pending socket error (`SO_ERROR`).
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    with_sockref(fd, |s| s.take_error())
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SockAddr> {
    with_sockref(fd, |s| s.local_addr())
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SockAddr> {
    with_sockref(fd, |s| s.peer_addr())
}

pub(crate) fn bind(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    with_sockref(fd, |s| s.bind(addr))
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    with_sockref(fd, |s| s.listen(backlog))
}

pub(crate) fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    with_sockref(fd, |s| s.connect(addr))
}

pub(crate) fn send(fd: RawFd, data: &[u8], to: Option<&SockAddr>) -> io::Result<usize> {
    with_sockref(fd, |s| loop {
        let res = match to {
            Some(addr) => s.send_to(data, addr),
            None => s.send(data),
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    })
}

pub(crate) fn set_write_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    with_sockref(fd, |s| s.set_write_timeout(timeout))
}

/// Bytes the kernel holds ready for reading.
pub(crate) fn bytes_available(fd: RawFd) -> io::Result<usize> {
    let mut n: nix::libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer.
    unsafe { fionread(fd, &mut n) }?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Closes a descriptor the caller owned. One that is already closed is only
/// logged.
pub(crate) fn close(fd: RawFd) {
    match nix::unistd::close(fd) {
        Ok(()) | Err(Errno::EINTR) => {}
        Err(Errno::EBADF) => debug!(fd, "descriptor was already closed"),
        Err(e) => warn!(fd, error = %e, "close failed"),
    }
}

/// Blocks the calling thread until `fd` is writable. `None` waits without limit.
///
/// Uses its own poller so it never interferes with the manager's registrations.
/// Returns `false` on timeout.
pub(crate) fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)?;
    let res = loop {
        match poll.poll(&mut events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => break res,
        }
    };
    let _ = poll.registry().deregister(&mut SourceFd(&fd));
    res?;
    Ok(!events.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn unused_descriptor_is_invalid() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(is_valid_descriptor(a.as_raw_fd()));
        assert!(!is_valid_descriptor(1 << 24));
    }

    #[test]
    fn received_chunk_keeps_only_its_bytes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let (data, _) = recv_from(a.as_raw_fd(), 32768).unwrap();
        assert_eq!(data, b"x");
        assert!(data.capacity() < 1024);
    }

    #[test]
    fn counts_pending_bytes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert_eq!(bytes_available(a.as_raw_fd()).unwrap(), 0);
        b.write_all(b"hello").unwrap();
        assert_eq!(bytes_available(a.as_raw_fd()).unwrap(), 5);
    }

    #[test]
    fn toggles_blocking_mode() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert!(!is_nonblocking(fd).unwrap());
        set_nonblocking(fd, true).unwrap();
        assert!(is_nonblocking(fd).unwrap());
    }

    #[test]
    fn fresh_pair_is_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(wait_writable(a.as_raw_fd(), Some(Duration::from_secs(1))).unwrap());
    }
}
