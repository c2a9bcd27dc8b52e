use std::{collections::HashMap, os::fd::RawFd, sync::Arc};

use crate::{error::SocketError, socket::SocketShared};

/// Process-wide map from native handle to the one socket wrapping it.
pub(crate) struct HandleTable<T = Arc<SocketShared>> {
    sockets: HashMap<RawFd, T>,
    limit: usize,
}

impl<T: Clone> HandleTable<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            sockets: HashMap::new(),
            limit,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<T> {
        self.sockets.get(&fd).cloned()
    }

    pub fn insert(&mut self, fd: RawFd, socket: T) -> Result<(), SocketError> {
        if !self.sockets.contains_key(&fd) && self.sockets.len() >= self.limit {
            return Err(SocketError::TableFull { limit: self.limit });
        }
        self.sockets.insert(fd, socket);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<T> {
        self.sockets.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_new_handles_when_full() {
        let mut table = HandleTable::new(2);
        table.insert(3, "a").unwrap();
        table.insert(4, "b").unwrap();
        assert!(matches!(
            table.insert(5, "c"),
            Err(SocketError::TableFull { limit: 2 })
        ));
        // replacing an existing entry does not grow the table
        table.insert(4, "d").unwrap();
        assert_eq!(table.get(4), Some("d"));

        assert_eq!(table.remove(3), Some("a"));
        table.insert(5, "c").unwrap();
        assert_eq!(table.len(), 2);
    }
}
