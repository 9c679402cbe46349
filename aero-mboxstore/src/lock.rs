//! Lock hierarchy (§4.1, §5): name-lock (process-wide, keyed by mailbox
//! name) and index-lock (advisory, held over the `cyrus.index` file
//! descriptor). Cache files need no lock since they are append-only
//! (§4.3).
//!
//! The name-lock is modeled the same way the in-process mailbox handle
//! table is elsewhere in this codebase: a process-wide registry guarded
//! by a single `RwLock`, keyed by name, handing out per-name state
//! instead of a single global mutex.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};

use nix::fcntl::{flock, FlockArg};

use crate::error::{Error, Result};

/// Acquisition mode shared by both lock kinds (§5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Whether a blocked acquisition should wait or fail immediately (§4.1
/// "NONBLOCKING" open mode, used by tools that must not stall on a busy
/// mailbox).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Block,
    NonBlocking,
}

struct NameLockState {
    readers: u32,
    writer: bool,
}

/// Process-wide table of name-locks, one entry per mailbox name that has
/// ever been locked. Entries are never removed: the table is expected to
/// stay small relative to the process lifetime (one entry per mailbox a
/// process has touched), mirroring the teacher's choice to keep open
/// mailbox handles in a long-lived in-process table rather than tearing
/// them down eagerly.
#[derive(Default)]
pub struct NameLockTable {
    inner: Mutex<HashMap<String, Arc<(Mutex<NameLockState>, Condvar)>>>,
}

/// RAII guard releasing a name-lock slot on drop.
pub struct NameLockGuard {
    cell: Arc<(Mutex<NameLockState>, Condvar)>,
    mode: LockMode,
}

impl NameLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_for(&self, name: &str) -> Arc<(Mutex<NameLockState>, Condvar)> {
        let mut table = self.inner.lock().unwrap();
        table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new((Mutex::new(NameLockState { readers: 0, writer: false }), Condvar::new())))
            .clone()
    }

    /// Acquire the name-lock for `name` in `mode`. Blocks unless `wait`
    /// is [`Wait::NonBlocking`], in which case a contended lock returns
    /// [`Error::Locked`] immediately (§4.1).
    pub fn lock(&self, name: &str, mode: LockMode, wait: Wait) -> Result<NameLockGuard> {
        let cell = self.cell_for(name);
        let (mutex, cvar) = &*cell;
        let mut state = mutex.lock().unwrap();
        loop {
            let available = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if available {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                drop(state);
                return Ok(NameLockGuard { cell: cell.clone(), mode });
            }
            if wait == Wait::NonBlocking {
                return Err(Error::Locked);
            }
            state = cvar.wait(state).unwrap();
        }
    }
}

impl Drop for NameLockGuard {
    fn drop(&mut self) {
        let (mutex, cvar) = &*self.cell;
        let mut state = mutex.lock().unwrap();
        match self.mode {
            LockMode::Shared => state.readers -= 1,
            LockMode::Exclusive => state.writer = false,
        }
        drop(state);
        cvar.notify_all();
    }
}

/// Advisory lock on the open `cyrus.index` file descriptor, taken with
/// `flock(2)` the way a legacy mbox backend locks its spool file before
/// mutating it.
pub struct IndexLock<'a> {
    file: &'a File,
}

impl<'a> IndexLock<'a> {
    /// Acquire the index-lock over `file` in `mode`. With
    /// [`Wait::NonBlocking`] a contended lock returns [`Error::Locked`]
    /// rather than blocking (used by `reconstruct` probing a live
    /// mailbox, §4.7).
    pub fn acquire(file: &'a File, mode: LockMode, wait: Wait) -> Result<Self> {
        let arg = match (mode, wait) {
            (LockMode::Shared, Wait::Block) => FlockArg::LockShared,
            (LockMode::Shared, Wait::NonBlocking) => FlockArg::LockSharedNonblock,
            (LockMode::Exclusive, Wait::Block) => FlockArg::LockExclusive,
            (LockMode::Exclusive, Wait::NonBlocking) => FlockArg::LockExclusiveNonblock,
        };
        flock(file.as_raw_fd(), arg).map_err(|e| match e {
            nix::errno::Errno::EWOULDBLOCK => Error::Locked,
            other => Error::Io(std::io::Error::from(other)),
        })?;
        Ok(IndexLock { file })
    }
}

impl<'a> Drop for IndexLock<'a> {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// Same advisory lock as [`IndexLock`], but owning its file descriptor
/// rather than borrowing it, so it can live alongside the index file
/// inside a [`crate::mailbox::MailboxHandle`] without a self-referential
/// borrow.
pub struct OwnedIndexLock {
    file: File,
}

impl OwnedIndexLock {
    pub fn acquire(file: File, mode: LockMode, wait: Wait) -> Result<Self> {
        let arg = match (mode, wait) {
            (LockMode::Shared, Wait::Block) => FlockArg::LockShared,
            (LockMode::Shared, Wait::NonBlocking) => FlockArg::LockSharedNonblock,
            (LockMode::Exclusive, Wait::Block) => FlockArg::LockExclusive,
            (LockMode::Exclusive, Wait::NonBlocking) => FlockArg::LockExclusiveNonblock,
        };
        flock(file.as_raw_fd(), arg).map_err(|e| match e {
            nix::errno::Errno::EWOULDBLOCK => Error::Locked,
            other => Error::Io(std::io::Error::from(other)),
        })?;
        Ok(OwnedIndexLock { file })
    }
}

impl Drop for OwnedIndexLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lock_allows_multiple_readers() {
        let table = NameLockTable::new();
        let a = table.lock("user.alice", LockMode::Shared, Wait::NonBlocking).unwrap();
        let b = table.lock("user.alice", LockMode::Shared, Wait::NonBlocking).unwrap();
        assert!(table.lock("user.alice", LockMode::Exclusive, Wait::NonBlocking).is_err());
        drop(a);
        drop(b);
        assert!(table.lock("user.alice", LockMode::Exclusive, Wait::NonBlocking).is_ok());
    }

    #[test]
    fn name_lock_is_per_name() {
        let table = NameLockTable::new();
        let _a = table.lock("user.alice", LockMode::Exclusive, Wait::NonBlocking).unwrap();
        assert!(table.lock("user.bob", LockMode::Exclusive, Wait::NonBlocking).is_ok());
    }

    #[test]
    fn index_lock_roundtrips_on_tempfile() {
        let file = tempfile::tempfile().unwrap();
        let lock = IndexLock::acquire(&file, LockMode::Exclusive, Wait::NonBlocking).unwrap();
        drop(lock);
        let lock2 = IndexLock::acquire(&file, LockMode::Shared, Wait::NonBlocking).unwrap();
        drop(lock2);
    }
}
