use std::{
    collections::VecDeque,
    fmt,
    hash::{Hash, Hasher},
    io, mem,
    os::fd::{OwnedFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::{debug, trace, warn};

use crate::{
    buffer::{Fill, ReadBuffer, ReadTimer},
    error::{Result, SocketError},
    reactor::{self, readiness::Watched, Manager},
    source::{pick_context, same_context, Context, EventSource, Registration, SchedulerContext},
    sys,
    types::{CallbackTypes, ReadKind, SocketEvent, SocketFlags},
};

/// Client callback. Runs on whichever scheduler context performs the socket's
/// event source.
pub type Callback = Arc<dyn Fn(&Socket, SocketEvent) + Send + Sync>;

/// Everything needed to create a socket and give it an address.
#[derive(Debug, Clone)]
pub struct SocketSignature {
    pub domain: Domain,
    pub ty: Type,
    pub protocol: Option<Protocol>,
    pub address: SockAddr,
}

/// A result fetched by the manager and waiting for delivery.
enum Received {
    Data {
        address: Option<SockAddr>,
        data: Vec<u8>,
    },
    Accept {
        address: Option<SockAddr>,
        handle: OwnedFd,
    },
}

#[derive(Educe)]
#[educe(Debug)]
struct SocketState {
    /// `None` once invalidated.
    handle: Option<RawFd>,
    flags: SocketFlags,
    disabled: CallbackTypes,
    connected: bool,
    read_signalled: bool,
    write_signalled: bool,
    /// Pending socket error fetched on write readiness.
    error_code: Option<i32>,
    address: Option<SockAddr>,
    peer_address: Option<SockAddr>,
    #[educe(Debug(ignore))]
    queue: VecDeque<Received>,
    buffer: ReadBuffer,
    schedule_count: usize,
    #[educe(Debug(ignore))]
    contexts: Vec<Context>,
    #[educe(Debug(ignore))]
    source: Option<Arc<EventSource>>,
    #[educe(Debug(ignore))]
    callback: Option<Callback>,
}

pub(crate) struct SocketShared {
    types: CallbackTypes,
    socket_type: Option<Type>,
    state: Mutex<SocketState>,
    /// Mirror of the read buffer's deadline so the manager can bound its wait
    /// without taking socket locks. Leaf lock.
    timer: Mutex<ReadTimer>,
    /// Serializes sends.
    write_lock: Mutex<()>,
    manager: &'static Manager,
}

impl Watched for Arc<SocketShared> {
    fn read_timer(&self) -> ReadTimer {
        *self.timer.lock()
    }
}

type Signal = Option<(Arc<EventSource>, Option<Context>)>;

/// A native socket watched by the socket manager.
///
/// Cloning is cheap and yields another handle to the same socket; equality is
/// identity. The socket stays registered (and its handle open) until
/// [`invalidate`](Socket::invalidate) runs, no matter how many handles exist.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    pub(crate) fn from_shared(shared: Arc<SocketShared>) -> Self {
        Self { shared }
    }

    /// Wraps `handle`, or returns the socket already wrapping it.
    ///
    /// The socket takes ownership of the handle and closes it on
    /// invalidation unless [`SocketFlags::CLOSE_ON_INVALIDATE`] is cleared.
    pub fn open<F>(handle: RawFd, types: CallbackTypes, callback: F) -> Result<Socket>
    where
        F: Fn(&Socket, SocketEvent) + Send + Sync + 'static,
    {
        Self::create(handle, types, Some(Arc::new(callback)), true)
    }

    /// Wraps `handle` in a fresh socket, invalidating any socket that already
    /// wraps it. The handle itself stays open for the new socket.
    pub fn open_unique<F>(handle: RawFd, types: CallbackTypes, callback: F) -> Result<Socket>
    where
        F: Fn(&Socket, SocketEvent) + Send + Sync + 'static,
    {
        Self::create(handle, types, Some(Arc::new(callback)), false)
    }

    /// Creates a native socket and wraps it.
    pub fn new<F>(
        domain: Domain,
        ty: Type,
        protocol: Option<Protocol>,
        types: CallbackTypes,
        callback: F,
    ) -> Result<Socket>
    where
        F: Fn(&Socket, SocketEvent) + Send + Sync + 'static,
    {
        let fd = sys::socket(domain, ty, protocol)?;
        Self::create(fd, types, Some(Arc::new(callback)), true).map_err(|e| {
            sys::close(fd);
            e
        })
    }

    /// Creates a socket and binds it to the signature's address, listening if
    /// the socket type supports it.
    pub fn create_bound<F>(
        signature: &SocketSignature,
        types: CallbackTypes,
        callback: F,
    ) -> Result<Socket>
    where
        F: Fn(&Socket, SocketEvent) + Send + Sync + 'static,
    {
        let socket = Self::new(
            signature.domain,
            signature.ty,
            signature.protocol,
            types,
            callback,
        )?;
        if let Err(e) = socket.bind(&signature.address) {
            socket.invalidate();
            return Err(e);
        }
        Ok(socket)
    }

    /// Creates a socket and connects it to the signature's address. See
    /// [`connect`](Socket::connect) for the meaning of `timeout`.
    pub fn create_connected<F>(
        signature: &SocketSignature,
        types: CallbackTypes,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<Socket>
    where
        F: Fn(&Socket, SocketEvent) + Send + Sync + 'static,
    {
        let socket = Self::new(
            signature.domain,
            signature.ty,
            signature.protocol,
            types,
            callback,
        )?;
        if let Err(e) = socket.connect(&signature.address, timeout) {
            socket.invalidate();
            return Err(e);
        }
        Ok(socket)
    }

    fn create(
        handle: RawFd,
        types: CallbackTypes,
        callback: Option<Callback>,
        reuse: bool,
    ) -> Result<Socket> {
        if handle < 0 {
            return Err(SocketError::InvalidHandle(handle));
        }
        let manager = reactor::manager()?;
        loop {
            let mut table = manager.table.lock();
            if let Some(existing) = table.get(handle) {
                if reuse {
                    return Ok(Socket::from_shared(existing));
                }
                drop(table);
                debug!(fd = handle, "replacing existing socket");
                {
                    let mut state = existing.state.lock();
                    state.flags = state.flags & !SocketFlags::CLOSE_ON_INVALIDATE;
                }
                existing.invalidate();
                continue;
            }

            let shared = Arc::new(SocketShared {
                types,
                socket_type: sys::socket_type(handle).ok(),
                state: Mutex::new(SocketState {
                    handle: Some(handle),
                    flags: SocketFlags::for_types(types),
                    disabled: CallbackTypes::NONE,
                    connected: false,
                    read_signalled: false,
                    write_signalled: false,
                    error_code: None,
                    address: None,
                    peer_address: None,
                    queue: VecDeque::new(),
                    buffer: ReadBuffer::default(),
                    schedule_count: 0,
                    contexts: Vec::new(),
                    source: None,
                    callback: callback.clone(),
                }),
                timer: Mutex::new(ReadTimer::default()),
                write_lock: Mutex::new(()),
                manager,
            });
            table.insert(handle, shared.clone())?;
            debug!(fd = handle, ?types, sockets = table.len(), "socket created");
            return Ok(Socket { shared });
        }
    }

    /// Tears the socket down: stops watching it, closes the handle if the
    /// socket owns it, drops queued events and the callback, and wakes every
    /// context it was scheduled on. Only the first call does anything.
    pub fn invalidate(&self) {
        self.shared.invalidate();
    }

    pub fn is_valid(&self) -> bool {
        self.shared.state.lock().handle.is_some()
    }

    /// The native handle, while valid.
    pub fn native(&self) -> Option<RawFd> {
        self.shared.state.lock().handle
    }

    pub fn callback_types(&self) -> CallbackTypes {
        self.shared.types
    }

    pub fn is_connection_oriented(&self) -> bool {
        self.shared.is_connection_oriented()
    }

    pub fn flags(&self) -> SocketFlags {
        self.shared.flags()
    }

    pub fn set_flags(&self, flags: SocketFlags) {
        let mut state = self.shared.state.lock();
        trace!(fd = ?state.handle, old = ?state.flags, new = ?flags, "flags changed");
        state.flags = flags;
    }

    /// Re-enables callback types, overriding earlier
    /// [`disable_callbacks`](Socket::disable_callbacks) calls.
    pub fn enable_callbacks(&self, types: CallbackTypes) {
        let mut state = self.shared.state.lock();
        self.shared.enable_locked(&mut state, types, true);
    }

    /// Stops delivering the given callback types until they are enabled
    /// again.
    pub fn disable_callbacks(&self, types: CallbackTypes) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let Some(fd) = state.handle else { return };
        if state.schedule_count == 0 {
            return;
        }
        let types = types & shared.types;
        state.disabled |= types;
        let read_kind = shared.types.read_kind();
        if shared.counts_as_connected() {
            state.connected = true;
        }
        trace!(fd, ?types, disabled = ?state.disabled, "callbacks disabled");

        let mut active = shared.manager.active.lock();
        if types.contains(CallbackTypes::WRITE)
            || (types.contains(CallbackTypes::CONNECT) && !state.connected)
        {
            active.disarm_write(fd);
        }
        if read_kind != ReadKind::None && types.intersects(read_kind.types()) {
            active.disarm_read(fd);
        }
    }

    /// Buffers reads on a byte-stream socket: the socket is reported readable
    /// once `length` bytes are buffered, the stream ends, or `timeout` passes
    /// after the last received bytes. A `length` of zero turns buffering off;
    /// bytes already buffered are kept for the following reads.
    pub fn set_read_buffer(&self, timeout: Duration, length: usize) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let changed = state.buffer.set_attrs(timeout, length);
        shared.publish_timer(&state);
        trace!(fd = ?state.handle, ?timeout, length, "read buffer set");
        drop(state);
        if changed {
            shared.manager.wake("read buffer changed");
        }
    }

    /// Reads bytes: leftovers from a resized buffer first, then the read
    /// buffer, then the socket itself. End of stream reads as `Ok(0)`. A
    /// failed read is replayed by every later read, except for
    /// `WouldBlock`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let fd = state.handle.ok_or(SocketError::Invalid)?;
        let res = state.buffer.read(buf, |out| sys::read(fd, out));
        shared.publish_timer(&state);
        trace!(fd, ?res, "client read");
        Ok(res?)
    }

    /// Bytes a read can return right now.
    pub fn bytes_available(&self) -> Result<usize> {
        let state = self.shared.state.lock();
        let fd = state.handle.ok_or(SocketError::Invalid)?;
        match state.buffer.available() {
            0 => Ok(sys::bytes_available(fd)?),
            n => Ok(n),
        }
    }

    /// Sends `data`, to `address` if given. Sends on one socket are
    /// serialized. A zero `timeout` waits without limit.
    pub fn send(
        &self,
        address: Option<&SockAddr>,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        if let Some(address) = address {
            check_address(address)?;
        }
        let fd = self.native().ok_or(SocketError::Invalid)?;
        let _guard = self.shared.write_lock.lock();
        sys::set_write_timeout(fd, (!timeout.is_zero()).then_some(timeout))?;
        match sys::send(fd, data, address) {
            Ok(n) => {
                trace!(fd, bytes = n, "sent");
                Ok(n)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                debug!(fd, "send timed out");
                Err(SocketError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Binds the socket to `address`, then listens on it if the socket type
    /// supports that. Only the bind result is reported.
    pub fn bind(&self, address: &SockAddr) -> Result<()> {
        check_address(address)?;
        let fd = self.native().ok_or(SocketError::Invalid)?;
        if let Err(e) = sys::bind(fd, address) {
            debug!(fd, error = %e, "bind failed");
            return Err(e.into());
        }
        if let Err(e) = sys::listen(fd, self.shared.manager.config.listen_backlog) {
            debug!(fd, error = %e, "listen after bind failed");
        }
        Ok(())
    }

    /// Connects to `address`.
    ///
    /// With `Some(timeout)` the call waits for the connection on the calling
    /// thread, without limit if the timeout is zero, and reports how it went.
    /// With `None` a connection still in progress is left to finish in the
    /// background; its outcome arrives as a [`SocketEvent::Connect`].
    pub fn connect(&self, address: &SockAddr, timeout: Option<Duration>) -> Result<()> {
        check_address(address)?;
        let fd = self.native().ok_or(SocketError::Invalid)?;

        let toggle = timeout != Some(Duration::ZERO) && !sys::is_nonblocking(fd).unwrap_or(false);
        if toggle {
            sys::set_nonblocking(fd, true)?;
        }

        let result = match sys::connect(fd, address) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(nix::libc::EINPROGRESS) => match timeout {
                None => {
                    debug!(fd, "connection continues in background");
                    Ok(())
                }
                Some(timeout) => {
                    let limit = (!timeout.is_zero()).then_some(timeout);
                    match sys::wait_writable(fd, limit) {
                        Ok(false) => Err(SocketError::Timeout),
                        Ok(true) => match sys::take_error(fd) {
                            Ok(Some(e)) => Err(e.into()),
                            _ => Ok(()),
                        },
                        Err(e) => Err(e.into()),
                    }
                }
            },
            Err(e) => Err(e.into()),
        };
        debug!(fd, ok = result.is_ok(), "connect attempt finished");

        if toggle {
            if let Err(e) = sys::set_nonblocking(fd, false) {
                warn!(fd, error = %e, "failed to restore blocking mode");
            }
        }
        result
    }

    /// The socket's local address, fetched once and cached.
    pub fn copy_address(&self) -> Option<SockAddr> {
        let mut state = self.shared.state.lock();
        let fd = state.handle?;
        if state.address.is_none() {
            state.address = sys::local_addr(fd).ok();
        }
        state.address.clone()
    }

    /// The connected peer's address, fetched once and cached.
    pub fn copy_peer_address(&self) -> Option<SockAddr> {
        let mut state = self.shared.state.lock();
        let fd = state.handle?;
        SocketShared::peer_address_locked(&mut state, fd)
    }

    /// The socket's event source, created on first use.
    pub fn create_event_source(&self) -> Result<Arc<EventSource>> {
        let mut state = self.shared.state.lock();
        if state.handle.is_none() {
            return Err(SocketError::Invalid);
        }
        let source = match &state.source {
            Some(source) if source.is_valid() => source.clone(),
            _ => {
                let source = EventSource::new(&self.shared);
                state.source = Some(source.clone());
                source
            }
        };
        Ok(source)
    }

    /// Shorthand for scheduling this socket's event source on `context`.
    pub fn schedule(&self, context: Arc<dyn SchedulerContext>) -> Result<Registration> {
        self.create_event_source()?.schedule(context)
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Socket {}

impl Hash for Socket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.shared).hash(state);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Socket");
        s.field("types", &self.shared.types);
        match self.shared.state.try_lock() {
            Some(state) => s.field("state", &*state),
            None => s.field("state", &format_args!("<locked>")),
        };
        s.finish()
    }
}

fn check_address(address: &SockAddr) -> Result<()> {
    let family_len = mem::size_of::<nix::libc::sa_family_t>();
    if (address.len() as usize) < family_len
        || address.family() == nix::libc::AF_UNSPEC as nix::libc::sa_family_t
    {
        return Err(SocketError::InvalidAddress);
    }
    Ok(())
}

fn call(callback: &Option<Callback>, socket: &Socket, event: SocketEvent) {
    if let Some(callback) = callback {
        callback(socket, event);
    }
}

impl SocketShared {
    fn flags(&self) -> SocketFlags {
        self.state.lock().flags
    }

    fn is_connection_oriented(&self) -> bool {
        matches!(self.socket_type, Some(ty) if ty == Type::STREAM || ty == Type::SEQPACKET)
    }

    /// Accept sockets and connectionless sockets never wait for a connect.
    fn counts_as_connected(&self) -> bool {
        self.types.read_kind() == ReadKind::Accept || !self.is_connection_oriented()
    }

    fn publish_timer(&self, state: &SocketState) {
        *self.timer.lock() = state.buffer.timer(Instant::now());
    }

    fn peer_address_locked(state: &mut SocketState, fd: RawFd) -> Option<SockAddr> {
        if state.peer_address.is_none() {
            state.peer_address = sys::peer_addr(fd).ok();
        }
        state.peer_address.clone()
    }

    /// Arms the callback types in the manager. `force` clears their disabled
    /// bits first; otherwise disabled types stay off.
    fn enable_locked(self: &Arc<Self>, state: &mut SocketState, types: CallbackTypes, force: bool) {
        let Some(fd) = state.handle else { return };
        if types.is_empty() || state.schedule_count == 0 {
            return;
        }
        let types = types & self.types;
        if force {
            state.disabled &= !types;
        }
        if self.counts_as_connected() {
            state.connected = true;
        }

        let (mut arm_write, mut arm_connect) = (false, false);
        if state.connected || !types.contains(CallbackTypes::CONNECT) {
            arm_write = types.contains(CallbackTypes::WRITE)
                && !state.disabled.contains(CallbackTypes::WRITE);
        } else {
            arm_connect = !state.disabled.contains(CallbackTypes::CONNECT);
        }
        let read_types = self.types.read_kind().types();
        let arm_read = !read_types.is_empty()
            && types.intersects(read_types)
            && !state.disabled.intersects(read_types);

        trace!(
            fd,
            ?types,
            force,
            disabled = ?state.disabled,
            connected = state.connected,
            "enabling callbacks"
        );
        if !(arm_read || arm_write || arm_connect) {
            return;
        }
        let mut wake = None;
        {
            let mut active = self.manager.active.lock();
            if arm_write || arm_connect {
                active.arm_write(fd, self);
            }
            if arm_read && active.arm_read(fd, self) && self.timer.lock().deadline.is_some() {
                wake = Some("armed socket with read timeout");
            }
            if active.is_faulted() {
                wake = Some("readiness sets need a sweep");
            }
        }
        if let Some(reason) = wake {
            self.manager.wake(reason);
        }
    }

    fn rearm_read(self: &Arc<Self>, state: &SocketState, fd: RawFd) {
        if state.schedule_count > 0 {
            self.manager.active.lock().arm_read(fd, self);
        }
    }

    /// Picks the context to hand a signal to. Delivered after the socket
    /// lock is released.
    fn prepare_signal(state: &mut SocketState) -> Signal {
        let source = state.source.clone()?;
        Some((source, pick_context(&mut state.contexts)))
    }

    fn deliver(signal: Signal) {
        if let Some((source, context)) = signal {
            source.signal(context);
        }
    }

    pub(crate) fn schedule(self: &Arc<Self>, context: Context) -> Result<()> {
        let mut state = self.state.lock();
        let Some(fd) = state.handle else {
            return Err(SocketError::Invalid);
        };
        state.contexts.push(context);
        state.schedule_count += 1;
        debug!(fd, count = state.schedule_count, "scheduled");
        if state.schedule_count == 1 {
            self.enable_locked(&mut state, self.types, true);
        }
        Ok(())
    }

    pub(crate) fn cancel(self: &Arc<Self>, context: &Context) {
        let mut state = self.state.lock();
        if state.schedule_count > 0 {
            state.schedule_count -= 1;
            if state.schedule_count == 0 {
                if let Some(fd) = state.handle {
                    debug!(fd, "last context cancelled; no longer watched");
                    self.manager.active.lock().remove(fd);
                }
            }
        }
        if let Some(idx) = state.contexts.iter().position(|c| same_context(c, context)) {
            state.contexts.remove(idx);
        }
    }

    /// Invalidates a socket whose descriptor was closed behind its back. The
    /// number may already belong to someone else, so it is not closed again.
    pub(crate) fn invalidate_closed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.flags = state.flags & !SocketFlags::CLOSE_ON_INVALIDATE;
        }
        self.invalidate();
    }

    pub(crate) fn invalidate(self: &Arc<Self>) {
        let mut table = self.manager.table.lock();
        let mut state = self.state.lock();
        let Some(fd) = state.handle.take() else {
            return;
        };
        state.read_signalled = false;
        state.write_signalled = false;
        self.manager.active.lock().remove(fd);
        if table.get(fd).map_or(false, |s| Arc::ptr_eq(&s, self)) {
            table.remove(fd);
        }
        if state.flags.contains(SocketFlags::CLOSE_ON_INVALIDATE) {
            sys::close(fd);
        }
        state.peer_address = None;
        // queued accepted handles close here
        state.queue.clear();
        state.schedule_count = 0;
        let contexts = mem::take(&mut state.contexts);
        let source = state.source.take();
        let callback = state.callback.take();
        *self.timer.lock() = ReadTimer::default();
        drop(state);

        for context in contexts.iter().rev() {
            context.wake();
        }
        drop(callback);
        if let Some(source) = source {
            source.invalidate();
        }
        drop(table);
        debug!(fd, "socket invalidated");
    }

    /// Manager side: the socket became writable, or its connect finished.
    pub(crate) fn handle_write(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let Some(fd) = state.handle else { return };
        let error = if state.flags.contains(SocketFlags::LEAVE_ERRORS) {
            None
        } else {
            sys::take_error(fd)
                .ok()
                .flatten()
                .map(|e| e.raw_os_error().unwrap_or(nix::libc::EIO))
        };
        if let Some(code) = error {
            debug!(fd, code, "pending socket error");
        }

        let mut available = self.types & (CallbackTypes::CONNECT | CallbackTypes::WRITE);
        if state.connected {
            available &= !CallbackTypes::CONNECT;
        }
        if state.disabled.contains(available) {
            return;
        }
        state.error_code = error;
        state.write_signalled = true;
        trace!(fd, "write signalled");
        let signal = Self::prepare_signal(&mut state);
        drop(state);
        Self::deliver(signal);
    }

    /// Manager side: the socket became readable, or its read buffer timed
    /// out.
    pub(crate) fn handle_read(self: &Arc<Self>, by_timeout: bool) {
        let mut state = self.state.lock();
        let Some(fd) = state.handle else { return };
        let read_types = self.types.read_kind().types();
        let reenable = state.schedule_count > 0
            && state.flags.reenabled().intersects(read_types)
            && !state.disabled.intersects(read_types);

        match self.types.read_kind() {
            ReadKind::Data => {
                let config = &self.manager.config;
                let max = if self.is_connection_oriented() {
                    config.max_stream_chunk
                } else {
                    config.max_datagram_size
                };
                let (data, address) = match sys::recv_from(fd, max) {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        self.rearm_read(&state, fd);
                        return;
                    }
                    Err(e) => {
                        debug!(fd, error = %e, "receive failed; reporting end of stream");
                        (Vec::new(), None)
                    }
                };
                let address = match address {
                    None if self.is_connection_oriented() => {
                        Self::peer_address_locked(&mut state, fd)
                    }
                    address => address,
                };
                trace!(fd, bytes = data.len(), "received");
                let more = !data.is_empty();
                state.queue.push_back(Received::Data { address, data });
                state.read_signalled = true;
                if more && reenable {
                    self.rearm_read(&state, fd);
                }
            }
            ReadKind::Accept => match sys::accept(fd) {
                Ok((handle, address)) => {
                    trace!(fd, "accepted connection");
                    state.queue.push_back(Received::Accept {
                        address: Some(address),
                        handle,
                    });
                    state.read_signalled = true;
                    if reenable {
                        self.rearm_read(&state, fd);
                    }
                }
                Err(e) if is_transient(&e) || e.raw_os_error() == Some(nix::libc::ECONNABORTED) => {
                    self.rearm_read(&state, fd);
                    return;
                }
                Err(e) => {
                    // re-armed by the next perform, so a persistent failure
                    // is throttled by the client context
                    warn!(fd, error = %e, "accept failed");
                    state.read_signalled = true;
                }
            },
            ReadKind::Read => {
                if state.disabled.intersects(CallbackTypes::READ) {
                    return;
                }
                let fill = if by_timeout {
                    trace!(fd, buffered = state.buffer.available(), "read buffer timeout");
                    state.buffer.on_timeout()
                } else {
                    state.buffer.fill(Instant::now(), |buf| sys::read(fd, buf))
                };
                self.publish_timer(&state);
                if fill == Fill::Rearm {
                    self.rearm_read(&state, fd);
                    return;
                }
                state.read_signalled = true;
            }
            ReadKind::None => return,
        }

        let signal = Self::prepare_signal(&mut state);
        drop(state);
        Self::deliver(signal);
    }

    /// Client side: delivers the signalled events to the callback, then
    /// re-arms the types that re-enable automatically.
    pub(crate) fn perform(self: &Arc<Self>) {
        let socket = Socket::from_shared(self.clone());
        let read_kind = self.types.read_kind();

        let mut state = self.state.lock();
        let Some(fd) = state.handle else { return };
        let mut signalled = CallbackTypes::NONE;
        if state.read_signalled {
            signalled |= read_kind.types();
        }
        if state.write_signalled {
            signalled |= CallbackTypes::WRITE;
        }
        let received = match read_kind {
            ReadKind::Data | ReadKind::Accept => state.queue.pop_front(),
            _ => None,
        };
        let read_signalled = mem::take(&mut state.read_signalled);
        let write_signalled = mem::take(&mut state.write_signalled);
        let connect_signalled = write_signalled && !state.connected;
        let mut error = None;
        if write_signalled {
            error = state.error_code.take();
            state.connected = true;
        }
        let callback = state.callback.clone();
        drop(state);
        trace!(fd, ?signalled, connect_signalled, "performing");

        // after the first callback, every further one needs the socket to
        // still be valid
        let mut called = false;
        let proceed = |called: bool| !called || socket.is_valid();

        if self.types.contains(CallbackTypes::CONNECT) && connect_signalled && proceed(called) {
            let error = error.map(io::Error::from_raw_os_error);
            call(&callback, &socket, SocketEvent::Connect { error });
            called = true;
        }
        match received {
            Some(Received::Data { address, data }) if proceed(called) => {
                let eof = data.is_empty();
                call(&callback, &socket, SocketEvent::Data { address, data });
                called = true;
                if eof && self.is_connection_oriented() {
                    debug!(fd, "end of stream delivered");
                    self.invalidate();
                }
            }
            Some(Received::Accept { address, handle }) if proceed(called) => {
                call(&callback, &socket, SocketEvent::Accept { address, handle });
                called = true;
            }
            _ => {}
        }
        if read_kind == ReadKind::Read && read_signalled && proceed(called) {
            call(&callback, &socket, SocketEvent::Read);
            called = true;
        }
        if self.types.contains(CallbackTypes::WRITE)
            && write_signalled
            && error.is_none()
            && proceed(called)
        {
            call(&callback, &socket, SocketEvent::Write);
        }
        drop(callback);

        let mut state = self.state.lock();
        if state.handle.is_none() {
            return;
        }
        let mut signal = None;
        if matches!(read_kind, ReadKind::Data | ReadKind::Accept) && !state.queue.is_empty() {
            trace!(fd, queued = state.queue.len(), "more queued; signalling again");
            signal = Self::prepare_signal(&mut state);
        }
        let reenable = signalled & state.flags.reenabled();
        self.enable_locked(&mut state, reenable, false);
        drop(state);
        Self::deliver(signal);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
