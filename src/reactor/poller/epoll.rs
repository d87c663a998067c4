//! Linux `epoll` poller shared by every idle worker.
//!
//! Responsibilities:
//! - Register, modify and remove edge-triggered descriptor interests
//! - Block a worker until readiness, a wake-up or a timeout
//! - Wake blocked workers through a self-pipe when new work arrives

use crate::reactor::event::Interest;
use crate::sys::{sys_close, sys_pipe, sys_read, sys_write};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLET, EPOLLIN, epoll_create1,
    epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::RawFd;
use std::ptr;

/// Reserved token of the wake pipe.
///
/// Descriptor tokens are the non-negative fd itself, so `u64::MAX` never
/// collides with them.
const WAKE_TOKEN: u64 = u64::MAX;

/// A descriptor reported ready by [`EpollPoller::poll`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    /// Ready directions, with errors and hang-ups mapped to both.
    pub(crate) interest: Interest,
}

/// Per-caller buffer filled by [`EpollPoller::poll`].
pub(crate) struct Events {
    raw: Vec<epoll_event>,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Descriptor readiness from the last poll, wake-ups excluded.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.raw
            .iter()
            .filter(|event| event.u64 != WAKE_TOKEN)
            .map(|event| Readiness {
                fd: event.u64 as RawFd,
                interest: Interest::from_epoll(event.events),
            })
    }

    fn woken(&self) -> bool {
        self.raw.iter().any(|event| event.u64 == WAKE_TOKEN)
    }
}

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - a non-blocking pipe whose read end is registered as the wake source.
///
/// All methods take `&self`: any number of workers may wait on the same
/// instance, each with its own [`Events`] buffer.
pub(crate) struct EpollPoller {
    epoll: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let (wake_read, wake_write) = match sys_pipe() {
            Ok(pipe) => pipe,
            Err(err) => {
                sys_close(epoll);
                return Err(err);
            }
        };

        let poller = Self {
            epoll,
            wake_read,
            wake_write,
        };

        // The pipe stays registered for the poller's whole life.
        poller.control(EPOLL_CTL_ADD, wake_read, EPOLLIN as u32 | EPOLLET as u32, WAKE_TOKEN)?;

        Ok(poller)
    }

    /// Starts watching `fd` for `interest`, edge-triggered.
    pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_ADD, fd, EPOLLET as u32 | interest.bits(), fd as u64)
    }

    /// Replaces the watched directions of an already added `fd`.
    pub(crate) fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_MOD, fd, EPOLLET as u32 | interest.bits(), fd as u64)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn control(&self, op: i32, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits up to `timeout_ms` for readiness.
    ///
    /// Blocks until:
    /// - at least one registered descriptor becomes ready,
    /// - [`wake`](Self::wake) is called,
    /// - or the timeout expires.
    ///
    /// Interrupted waits are retried. A wake-up drains the pipe completely.
    pub(crate) fn poll(&self, events: &mut Events, timeout_ms: u64) -> io::Result<usize> {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let capacity = events.raw.capacity();

        let n = loop {
            let n = unsafe {
                epoll_wait(
                    self.epoll,
                    events.raw.as_mut_ptr(),
                    capacity as i32,
                    timeout,
                )
            };

            if n >= 0 {
                break n as usize;
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                unsafe { events.raw.set_len(0) };
                return Err(err);
            }
        };

        // SAFETY: epoll_wait initialized the first `n <= capacity` entries.
        unsafe { events.raw.set_len(n) };

        if events.woken() {
            self.drain_wake();
        }

        Ok(n)
    }

    /// Interrupts one blocked [`poll`](Self::poll).
    ///
    /// A full pipe already guarantees a pending wake-up, so a failed write
    /// is ignored.
    pub(crate) fn wake(&self) {
        let _ = sys_write(self.wake_write, &[b'T']);
    }

    fn drain_wake(&self) {
        let mut buffer = [0u8; 256];
        while sys_read(self.wake_read, &mut buffer) > 0 {}
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys_close(self.wake_read);
        sys_close(self.wake_write);
        sys_close(self.epoll);
    }
}
