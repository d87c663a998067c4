use super::event::{Event, Interest};
use crate::fiber::{Fiber, FiberBody};
use crate::scheduler::{Schedule, Task};

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::trace;

/// What to resume once a direction becomes ready.
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(FiberBody),
}

/// A registered waiter and the scheduler that must run it.
pub(crate) struct EventSlot {
    pub(crate) scheduler: Arc<dyn Schedule>,
    pub(crate) waiter: Waiter,
    /// Identifies the registration, unique per manager.
    pub(crate) token: u64,
}

impl EventSlot {
    /// Hands the waiter back to its scheduler.
    pub(crate) fn fire(self, fd: RawFd, event: Event) {
        let task = match self.waiter {
            Waiter::Fiber(fiber) => {
                trace!(fd, %event, fiber = fiber.id(), "waking fiber");
                Task::fiber(fiber)
            }
            Waiter::Callback(callback) => {
                trace!(fd, %event, "scheduling callback");
                Task::from(callback)
            }
        };

        self.scheduler.scheduler().schedule(task);
    }
}

/// Registration state of one descriptor.
#[derive(Default)]
pub(crate) struct FdState {
    pub(crate) interest: Interest,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdState {
    pub(crate) fn slot_mut(&mut self, event: Event) -> &mut Option<EventSlot> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    pub(crate) fn token(&self, event: Event) -> Option<u64> {
        let slot = match event {
            Event::Read => &self.read,
            Event::Write => &self.write,
        };
        slot.as_ref().map(|slot| slot.token)
    }

    /// Removes `event` from the registered set and returns its waiter.
    pub(crate) fn take(&mut self, event: Event) -> Option<EventSlot> {
        self.interest = self.interest.without(Interest::from(event));
        self.slot_mut(event).take()
    }
}

/// Per-descriptor entry of the I/O manager's table.
///
/// Created on the first registration for a descriptor and only ever
/// cleared afterwards, never removed.
pub(crate) struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FdState> {
        self.state.lock()
    }
}

impl fmt::Debug for FdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd)
            .field("interest", &self.state.lock().interest)
            .finish()
    }
}
