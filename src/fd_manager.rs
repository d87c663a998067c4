//! Per-descriptor metadata for code that intercepts blocking calls.
//!
//! An interception layer needs to know, for every descriptor it sees,
//! whether it is a socket, whether the user asked for non-blocking mode
//! and which send/receive timeouts apply. [`FdManager`] keeps one
//! [`FdCtx`] per descriptor, created on demand.

use crate::sys::{sys_is_socket, sys_set_nonblocking};

use parking_lot::RwLock;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Stored in a timeout slot when no timeout is set.
const NO_TIMEOUT: u64 = u64::MAX;

const INITIAL_TABLE_SIZE: usize = 64;

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

/// Which socket timeout to read or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

/// What is known about one descriptor.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    /// Set when this crate put the descriptor in non-blocking mode.
    sys_nonblock: bool,
    /// Set when the user asked for non-blocking mode.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    /// Inspects `fd`. Sockets are switched to non-blocking mode so that
    /// waits can go through the I/O manager.
    pub fn new(fd: RawFd) -> Self {
        let (is_init, is_socket) = match sys_is_socket(fd) {
            Ok(is_socket) => (true, is_socket),
            Err(_) => (false, false),
        };

        let sys_nonblock = is_socket
            && match sys_set_nonblocking(fd) {
                Ok(()) => true,
                Err(err) => {
                    warn!(fd, error = %err, "cannot make socket non-blocking");
                    false
                }
            };

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `false` when `fstat` failed on the descriptor.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.slot(kind).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.slot(kind)
            .store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }
}

/// Table of [`FdCtx`] indexed by descriptor.
#[derive(Debug)]
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn new() -> Self {
        let mut fds = Vec::new();
        fds.resize_with(INITIAL_TABLE_SIZE, || None);

        Self {
            fds: RwLock::new(fds),
        }
    }

    /// Returns the entry for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let index = usize::try_from(fd).ok()?;

        if let Some(entry) = self.fds.read().get(index) {
            if entry.is_some() || !auto_create {
                return entry.clone();
            }
        } else if !auto_create {
            return None;
        }

        let mut fds = self.fds.write();
        if index >= fds.len() {
            let grown = (index + 1).max(fds.len() + fds.len() / 2);
            fds.resize_with(grown, || None);
        }

        let ctx = fds[index].get_or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(ctx.clone())
    }

    /// Forgets `fd`, typically right after it is closed.
    pub fn del(&self, fd: RawFd) {
        let Ok(index) = usize::try_from(fd) else {
            return;
        };

        if let Some(entry) = self.fds.write().get_mut(index) {
            *entry = None;
        }
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide descriptor table.
pub fn fd_manager() -> &'static FdManager {
    FD_MANAGER.get_or_init(FdManager::new)
}
