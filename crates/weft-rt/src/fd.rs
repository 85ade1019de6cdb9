//! Per-fd metadata consulted by the syscall shim.
//!
//! The process-wide [`FdTable`] maps fd numbers to lazily created
//! [`FdInfo`] entries. On first sight of an fd the entry probes it with
//! `fstat`; sockets are forced into nonblocking mode so the shim can turn
//! their would-block results into suspensions. Entries also carry the
//! per-direction timeouts recorded from `setsockopt` and a closed flag that
//! lets a racing waiter observe the close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::c_int;
use parking_lot::RwLock;

const INITIAL_CAPACITY: usize = 64;

/// Stored timeout value meaning "no timeout configured". Distinct from a
/// real 0 so the two are never conflated.
const TIMEOUT_UNSET: u64 = u64::MAX;

/// Which configured timeout applies to an I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

// ---------------------------------------------------------------------------
// FdInfo
// ---------------------------------------------------------------------------

/// Metadata for one file descriptor.
pub struct FdInfo {
    fd: c_int,
    initialized: bool,
    is_socket: bool,
    nonblock_forced: bool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdInfo {
    /// Probe `fd` and build its entry. Sockets get `O_NONBLOCK` added to
    /// their existing flag bits.
    fn probe(fd: c_int) -> FdInfo {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let (initialized, is_socket) = if unsafe { libc::fstat(fd, &mut st) } == -1 {
            (false, false)
        } else {
            (true, st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut nonblock_forced = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags != -1 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                nonblock_forced = true;
            }
        }

        FdInfo {
            fd,
            initialized,
            is_socket,
            nonblock_forced,
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_UNSET),
            send_timeout_ms: AtomicU64::new(TIMEOUT_UNSET),
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the runtime itself switched this fd to nonblocking. The shim
    /// only intercepts such fds; descriptors whose mode the caller manages
    /// pass straight through.
    pub fn nonblock_forced(&self) -> bool {
        self.nonblock_forced
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Configured timeout for the direction, in milliseconds.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.slot(kind).load(Ordering::SeqCst);
        (ms != TIMEOUT_UNSET).then_some(ms)
    }

    /// Record a timeout; `None` clears it.
    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.slot(kind)
            .store(ms.unwrap_or(TIMEOUT_UNSET), Ordering::SeqCst);
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// FdTable
// ---------------------------------------------------------------------------

/// Lazily grown, fd-indexed table of [`FdInfo`] entries.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut slots = Vec::new();
        slots.resize_with(INITIAL_CAPACITY, || None);
        FdTable {
            slots: RwLock::new(slots),
        }
    }

    /// Fetch the entry for `fd`, creating (and probing) it when
    /// `auto_create` is set.
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            if let Some(Some(info)) = slots.get(idx) {
                return Some(Arc::clone(info));
            }
        }
        if !auto_create {
            return None;
        }
        let mut slots = self.slots.write();
        if idx >= slots.len() {
            slots.resize_with((idx + 1).max(idx * 3 / 2), || None);
        }
        if let Some(info) = &slots[idx] {
            return Some(Arc::clone(info));
        }
        let info = Arc::new(FdInfo::probe(fd));
        slots[idx] = Some(Arc::clone(&info));
        Some(info)
    }

    /// Drop the entry for `fd`, if any.
    pub fn delete(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}

/// The process-wide fd table.
pub fn table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_socket() -> c_int {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_absent_without_auto_create() {
        let table = FdTable::new();
        let fd = raw_socket();
        assert!(table.get(fd, false).is_none());
        assert!(table.get(-1, true).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_probe_forces_nonblock() {
        let table = FdTable::new();
        let fd = raw_socket();
        let info = table.get(fd, true).unwrap();

        assert!(info.is_initialized());
        assert!(info.is_socket());
        assert!(info.nonblock_forced());
        assert!(!info.is_closed());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_passthrough_metadata() {
        let table = FdTable::new();
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let info = table.get(fds[0], true).unwrap();
        assert!(info.is_initialized());
        assert!(!info.is_socket());
        assert!(!info.nonblock_forced());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeouts_default_unset() {
        let table = FdTable::new();
        let fd = raw_socket();
        let info = table.get(fd, true).unwrap();

        assert_eq!(info.timeout(TimeoutKind::Recv), None);
        assert_eq!(info.timeout(TimeoutKind::Send), None);

        info.set_timeout(TimeoutKind::Recv, Some(0));
        assert_eq!(info.timeout(TimeoutKind::Recv), Some(0));
        info.set_timeout(TimeoutKind::Recv, Some(250));
        assert_eq!(info.timeout(TimeoutKind::Recv), Some(250));
        info.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(info.timeout(TimeoutKind::Recv), None);
        assert_eq!(info.timeout(TimeoutKind::Send), None);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_delete_then_recreate() {
        let table = FdTable::new();
        let fd = raw_socket();

        let first = table.get(fd, true).unwrap();
        first.set_timeout(TimeoutKind::Send, Some(100));
        table.delete(fd);
        assert!(table.get(fd, false).is_none());

        let second = table.get(fd, true).unwrap();
        assert_eq!(second.timeout(TimeoutKind::Send), None);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let table = FdTable::new();
        let fd = raw_socket();
        // Force a high index through dup2 so the table has to grow.
        let high = 200 as c_int;
        assert!(unsafe { libc::dup2(fd, high) } >= 0);

        let info = table.get(high, true).unwrap();
        assert!(info.is_socket());
        assert!(table.get(high, false).is_some());

        unsafe {
            libc::close(fd);
            libc::close(high);
        }
    }
}
