//! Callback types, client flags and the events delivered to socket callbacks.

use std::{
    fmt, io,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
    os::fd::OwnedFd,
};

use socket2::SockAddr;

/// The set of events a socket can report to its callback.
///
/// The low two bits select the read kind: `READ`, `ACCEPT` and `DATA` are
/// mutually exclusive ways of handling readability, fixed when the socket is
/// opened. `CONNECT` and `WRITE` can be combined with any of them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CallbackTypes(u8);

impl CallbackTypes {
    pub const NONE: Self = Self(0);
    /// The socket is readable; the client reads with [`Socket::read`](crate::Socket::read).
    pub const READ: Self = Self(1);
    /// A connection was accepted on a listening socket.
    pub const ACCEPT: Self = Self(2);
    /// Data was received and is delivered with the event.
    pub const DATA: Self = Self(3);
    /// A background connect finished.
    pub const CONNECT: Self = Self(4);
    /// The socket is writable.
    pub const WRITE: Self = Self(8);

    const READ_MASK: u8 = 3;
    const ALL: u8 = 0x0f;

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Which read kind these types select.
    #[must_use]
    pub const fn read_kind(self) -> ReadKind {
        match self.0 & Self::READ_MASK {
            1 => ReadKind::Read,
            2 => ReadKind::Accept,
            3 => ReadKind::Data,
            _ => ReadKind::None,
        }
    }
}

impl fmt::Debug for CallbackTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        match self.read_kind() {
            ReadKind::None => {}
            kind => {
                list.entry(&kind);
            }
        }
        if self.contains(Self::CONNECT) {
            list.entry(&format_args!("Connect"));
        }
        if self.contains(Self::WRITE) {
            list.entry(&format_args!("Write"));
        }
        list.finish()
    }
}

impl BitOr for CallbackTypes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CallbackTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CallbackTypes {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for CallbackTypes {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for CallbackTypes {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL)
    }
}

/// How a socket handles readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    None,
    /// Byte stream; the client pulls bytes itself.
    Read,
    /// Listening socket; the manager accepts connections.
    Accept,
    /// The manager receives data and queues it for delivery.
    Data,
}

impl ReadKind {
    /// The callback type bits belonging to this read kind.
    #[must_use]
    pub const fn types(self) -> CallbackTypes {
        match self {
            ReadKind::None => CallbackTypes::NONE,
            ReadKind::Read => CallbackTypes::READ,
            ReadKind::Accept => CallbackTypes::ACCEPT,
            ReadKind::Data => CallbackTypes::DATA,
        }
    }
}

/// Client-controlled behaviour flags of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SocketFlags(u8);

impl SocketFlags {
    pub const NONE: Self = Self(0);
    pub const AUTO_REENABLE_READ: Self = Self(1);
    pub const AUTO_REENABLE_ACCEPT: Self = Self(2);
    pub const AUTO_REENABLE_DATA: Self = Self(3);
    pub const AUTO_REENABLE_WRITE: Self = Self(8);
    /// Do not fetch the pending socket error when the socket becomes writable.
    pub const LEAVE_ERRORS: Self = Self(64);
    /// Close the native handle when the socket is invalidated.
    pub const CLOSE_ON_INVALIDATE: Self = Self(128);

    /// Flags a freshly opened socket starts with: its read kind re-enables
    /// itself after every callback, connect and write do not, and the handle
    /// is closed on invalidation.
    #[must_use]
    pub const fn for_types(types: CallbackTypes) -> Self {
        let reenable = types.0 & !(CallbackTypes::CONNECT.0 | CallbackTypes::WRITE.0);
        Self(reenable | Self::CLOSE_ON_INVALIDATE.0)
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The callback types that are re-enabled automatically after a `perform`.
    #[must_use]
    pub const fn reenabled(self) -> CallbackTypes {
        CallbackTypes::from_bits(self.0)
    }
}

impl BitOr for SocketFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for SocketFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for SocketFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// An event handed to a socket callback on its scheduler context.
#[derive(Debug)]
pub enum SocketEvent {
    /// The socket has bytes to read (or its read buffer filled up or timed out).
    Read,
    /// A datagram or stream chunk. An empty `data` marks end of stream; a
    /// connection-oriented socket is invalidated right after this event.
    Data {
        address: Option<SockAddr>,
        data: Vec<u8>,
    },
    /// A connection accepted on a listening socket. The callback owns `handle`.
    Accept {
        address: Option<SockAddr>,
        handle: OwnedFd,
    },
    /// A background connect completed, successfully or with `error`.
    Connect { error: Option<io::Error> },
    /// The socket is writable.
    Write,
}

impl SocketEvent {
    /// The callback type this event reports.
    #[must_use]
    pub fn kind(&self) -> CallbackTypes {
        match self {
            SocketEvent::Read => CallbackTypes::READ,
            SocketEvent::Data { .. } => CallbackTypes::DATA,
            SocketEvent::Accept { .. } => CallbackTypes::ACCEPT,
            SocketEvent::Connect { .. } => CallbackTypes::CONNECT,
            SocketEvent::Write => CallbackTypes::WRITE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_kind_is_taken_from_low_bits() {
        assert_eq!(CallbackTypes::NONE.read_kind(), ReadKind::None);
        assert_eq!(CallbackTypes::READ.read_kind(), ReadKind::Read);
        assert_eq!(
            (CallbackTypes::ACCEPT | CallbackTypes::WRITE).read_kind(),
            ReadKind::Accept
        );
        assert_eq!(
            (CallbackTypes::DATA | CallbackTypes::CONNECT).read_kind(),
            ReadKind::Data
        );
        assert_eq!(CallbackTypes::WRITE.read_kind(), ReadKind::None);
    }

    #[test]
    fn not_stays_within_defined_bits() {
        let types = !CallbackTypes::WRITE;
        assert_eq!(types.bits(), 0x07);
        assert!(types.contains(CallbackTypes::DATA | CallbackTypes::CONNECT));
    }

    #[test]
    fn default_flags_reenable_read_kind_only() {
        let flags = SocketFlags::for_types(
            CallbackTypes::DATA | CallbackTypes::CONNECT | CallbackTypes::WRITE,
        );
        assert!(flags.contains(SocketFlags::AUTO_REENABLE_DATA));
        assert!(flags.contains(SocketFlags::CLOSE_ON_INVALIDATE));
        assert!(!flags.contains(SocketFlags::AUTO_REENABLE_WRITE));
        assert_eq!(flags.reenabled(), CallbackTypes::DATA);
    }

    #[test]
    fn debug_lists_members() {
        let text = format!("{:?}", CallbackTypes::ACCEPT | CallbackTypes::WRITE);
        assert_eq!(text, "{Accept, Write}");
    }
}
