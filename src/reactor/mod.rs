//! Event-driven I/O on top of the fiber scheduler.
//!
//! [`IoManager`] is a [`Schedule`] implementation whose idle workers block
//! in `epoll_wait` instead of on a condition variable. A fiber that needs a
//! descriptor to become readable or writable registers itself with
//! [`IoManager::wait_event`] and suspends; the first idle worker that sees
//! the readiness hands the fiber back to its scheduler.
//!
//! The wait is also bounded by the manager's nearest timer, so timers and
//! descriptor readiness are served by the same loop.
//!
//! ```rust,ignore
//! let iom = IoManager::new(2, false, "io")?;
//! let (reader, mut writer) = UnixStream::pair()?;
//! reader.set_nonblocking(true)?;
//!
//! let fd = reader.as_raw_fd();
//! let manager = iom.clone();
//! iom.spawn(move || {
//!     manager.wait_event(fd, Event::Read).unwrap();
//!     println!("readable");
//! });
//!
//! writer.write_all(b"x")?;
//! iom.stop();
//! ```

mod event;
mod fd_context;
mod poller;

pub use event::Event;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberBody};
use crate::scheduler::{Schedule, Scheduler, Task};
use crate::timer::{Timer, TimerCallback, TimerManager};
use event::Interest;
use fd_context::{EventSlot, FdContext, Waiter};
use poller::{Events, Poller, Readiness};

use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak, mpsc};
use tracing::{debug, error, trace};

/// Poll bound of idle workers once a stop was requested.
const STOP_POLL_TIMEOUT_MS: u64 = 10;

/// Scheduler whose workers wait on descriptor readiness and timers.
pub struct IoManager {
    scheduler: Scheduler,
    timers: TimerManager,
    poller: Poller,

    /// Indexed by descriptor; grows on demand.
    fds: RwLock<Vec<Option<Arc<FdContext>>>>,

    /// Registered directions across all descriptors.
    pending: AtomicUsize,

    /// Source of registration tokens.
    next_token: AtomicU64,

    this: Weak<IoManager>,
}

impl IoManager {
    /// Creates and starts an I/O manager with `threads` workers.
    ///
    /// See [`Scheduler::new`] for the meaning of `use_caller`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        Self::with_config(threads, use_caller, name, Config::default())
    }

    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: Config,
    ) -> Result<Arc<IoManager>> {
        let poller = Poller::new()?;
        let table_size = config.fd_table_size;

        let manager = Arc::new_cyclic(|this: &Weak<IoManager>| {
            let driver: Weak<dyn Schedule> = this.clone();

            let front = this.clone();
            let timers = TimerManager::with_front_hook(move || {
                if let Some(manager) = front.upgrade() {
                    manager.tickle();
                }
            });

            let mut fds = Vec::new();
            fds.resize_with(table_size, || None);

            IoManager {
                scheduler: Scheduler::for_driver(driver, threads, use_caller, name, config),
                timers,
                poller,
                fds: RwLock::new(fds),
                pending: AtomicUsize::new(0),
                next_token: AtomicU64::new(1),
                this: this.clone(),
            }
        });

        manager.scheduler.start()?;

        Ok(manager)
    }

    /// The I/O manager driving the calling thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current()?.into_any().downcast::<IoManager>().ok()
    }

    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Drains every task, timer and registration, then joins the workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn schedule(&self, task: impl Into<Task>) {
        self.scheduler.schedule(task);
    }

    pub fn schedule_on(&self, task: impl Into<Task>, worker: usize) {
        self.scheduler.schedule_on(task, worker);
    }

    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        self.scheduler.schedule_all(tasks);
    }

    pub fn spawn<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(callback);
    }

    /// Number of registered (fd, direction) pairs.
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

    pub fn add_condition_timer<T, F>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, callback, condition, recurring)
    }

    pub fn next_timer(&self) -> Option<u64> {
        self.timers.next_timer()
    }

    /// Runs `callback` once `fd` is ready for `event`.
    ///
    /// The callback is scheduled on the scheduler of the calling thread, or
    /// on this manager when called from outside any worker.
    pub fn add_event<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Waiter::Callback(Box::new(callback) as FiberBody))
            .map(|_| ())
    }

    /// Suspends the calling fiber until `fd` is ready for `event`.
    ///
    /// A [`cancel_event`](Self::cancel_event) or
    /// [`cancel_all`](Self::cancel_all) also resumes the fiber, so the
    /// caller must re-check the descriptor.
    pub fn wait_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let fiber = scheduled_fiber()?;

        self.register(fd, event, Waiter::Fiber(fiber))?;
        Fiber::yield_to_hold();

        Ok(())
    }

    /// Like [`wait_event`](Self::wait_event), giving up after `ms`
    /// milliseconds with [`Error::TimedOut`].
    pub fn wait_event_timeout(&self, fd: RawFd, event: Event, ms: u64) -> Result<()> {
        let fiber = scheduled_fiber()?;

        let token = self.register(fd, event, Waiter::Fiber(fiber))?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = Arc::downgrade(&timed_out);
        let manager = self.this.clone();

        let timer = self.timers.add_condition_timer(
            ms,
            move || {
                let (Some(flag), Some(manager)) = (flag.upgrade(), manager.upgrade()) else {
                    return;
                };

                // Only the registration armed above counts as a timeout;
                // otherwise readiness already resumed the fiber.
                if let Some(slot) = manager.detach(fd, event, Some(token)) {
                    flag.store(true, Ordering::Release);
                    slot.fire(fd, event);
                }
            },
            Arc::downgrade(&timed_out),
            false,
        );

        Fiber::yield_to_hold();
        timer.cancel();

        if timed_out.load(Ordering::Acquire) {
            return Err(Error::TimedOut);
        }

        Ok(())
    }

    /// Suspends the calling fiber for `ms` milliseconds.
    pub fn sleep_ms(&self, ms: u64) -> Result<()> {
        let fiber = scheduled_fiber()?;
        let scheduler = Scheduler::current().ok_or(Error::NotInFiber)?;

        self.timers.add_timer(
            ms,
            move || scheduler.scheduler().schedule(Task::fiber(fiber.clone())),
            false,
        );
        Fiber::yield_to_hold();

        Ok(())
    }

    /// Runs `f` in a fiber on this manager and blocks the calling thread
    /// until it returns.
    ///
    /// Returns [`Error::Aborted`] if `f` panics.
    ///
    /// # Panics
    ///
    /// Panics when called from one of the manager's workers, which would
    /// have nobody left to run `f`.
    pub fn block_on<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            Scheduler::current_worker().is_none(),
            "block_on cannot be called from a scheduler thread"
        );

        let (sender, receiver) = mpsc::channel();
        self.scheduler.spawn(move || {
            let _ = sender.send(f());
        });

        receiver.recv().map_err(|_| Error::Aborted)
    }

    /// Removes the `event` registration of `fd` without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.detach(fd, event, None).is_some()
    }

    /// Removes the `event` registration of `fd` and resumes its waiter.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        match self.detach(fd, event, None) {
            Some(slot) => {
                slot.fire(fd, event);
                true
            }
            None => false,
        }
    }

    /// Removes every registration of `fd`, resuming all waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(context) = self.context(fd, false) else {
            return false;
        };

        let fired: Vec<(Event, EventSlot)> = {
            let mut state = context.lock();
            if state.interest.is_empty() {
                return false;
            }

            if let Err(err) = self.poller.delete(fd) {
                self.report(poller_error("DEL", fd, err));
                return false;
            }

            let registered: Vec<Event> = state.interest.events().collect();
            registered
                .into_iter()
                .filter_map(|event| state.take(event).map(|slot| (event, slot)))
                .collect()
        };

        self.pending.fetch_sub(fired.len(), Ordering::AcqRel);
        for (event, slot) in fired {
            slot.fire(fd, event);
        }

        true
    }

    /// Stores `waiter` for `event` on `fd` and returns the registration token.
    fn register(&self, fd: RawFd, event: Event, waiter: Waiter) -> Result<u64> {
        let scheduler = Scheduler::current()
            .or_else(|| self.scheduler.driver())
            .ok_or(Error::NoScheduler)?;

        let context = self.context(fd, true).ok_or(Error::InvalidFd(fd))?;
        let mut state = context.lock();

        if state.interest.contains(event) {
            error!(fd, %event, interest = state.interest.bits(), "event already registered");
            return Err(Error::AlreadyRegistered { fd, event });
        }

        let interest = state.interest | event;
        let registered = if state.interest.is_empty() {
            self.poller.add(fd, interest).map_err(|err| poller_error("ADD", fd, err))
        } else {
            self.poller
                .modify(fd, interest)
                .map_err(|err| poller_error("MOD", fd, err))
        };

        if let Err(err) = registered {
            return Err(self.report(err));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.interest = interest;
        *state.slot_mut(event) = Some(EventSlot {
            scheduler,
            waiter,
            token,
        });

        trace!(fd, %event, token, "event registered");

        Ok(token)
    }

    /// Drops `event` from the registration of `fd` and returns its waiter.
    ///
    /// With a `token`, only that exact registration is removed.
    fn detach(&self, fd: RawFd, event: Event, token: Option<u64>) -> Option<EventSlot> {
        let context = self.context(fd, false)?;
        let mut state = context.lock();

        if !state.interest.contains(event) {
            return None;
        }

        if token.is_some_and(|token| state.token(event) != Some(token)) {
            return None;
        }

        let remaining = state.interest.without(Interest::from(event));
        if let Err(err) = self.rearm(fd, remaining) {
            self.report(err);
            return None;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        state.take(event)
    }

    /// Narrows the epoll registration of `fd` to `remaining`, or removes it.
    fn rearm(&self, fd: RawFd, remaining: Interest) -> Result<()> {
        if remaining.is_empty() {
            self.poller
                .delete(fd)
                .map_err(|err| poller_error("DEL", fd, err))
        } else {
            self.poller
                .modify(fd, remaining)
                .map_err(|err| poller_error("MOD", fd, err))
        }
    }

    fn report(&self, err: Error) -> Error {
        error!(scheduler = %self.scheduler.name(), error = %err, "poller operation failed");
        err
    }

    /// Looks up the table entry of `fd`, creating it when `create` is set.
    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;

        if let Some(Some(context)) = self.fds.read().get(index) {
            return Some(context.clone());
        }

        if !create {
            return None;
        }

        let mut fds = self.fds.write();
        if index >= fds.len() {
            let grown = (index + 1).max(fds.len() + fds.len() / 2);
            fds.resize_with(grown, || None);
        }

        let context = fds[index].get_or_insert_with(|| Arc::new(FdContext::new(fd)));
        Some(context.clone())
    }

    /// Fires the waiters of every direction `ready` reports.
    fn dispatch(&self, ready: Readiness) {
        let Some(context) = self.context(ready.fd, false) else {
            return;
        };

        let fired: Vec<(Event, EventSlot)> = {
            let mut state = context.lock();

            let real = ready.interest.intersect(state.interest);
            if real.is_empty() {
                return;
            }

            let remaining = state.interest.without(real);
            if let Err(err) = self.rearm(context.fd(), remaining) {
                self.report(err);
                return;
            }

            real.events()
                .filter_map(|event| state.take(event).map(|slot| (event, slot)))
                .collect()
        };

        self.pending.fetch_sub(fired.len(), Ordering::AcqRel);
        for (event, slot) in fired {
            slot.fire(ready.fd, event);
        }
    }

    fn schedule_expired(&self, expired: &mut Vec<TimerCallback>) {
        self.timers.list_expired_callbacks(expired);
        if expired.is_empty() {
            return;
        }

        trace!(count = expired.len(), "timers expired");
        self.scheduler
            .schedule_all(expired.drain(..).map(|callback| Task::callback(move || callback())));
    }
}

impl Schedule for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Writes one byte to the wake pipe, but only when some worker may be
    /// blocked in `epoll_wait`.
    fn tickle(&self) {
        if !self.scheduler.has_idle_workers() {
            return;
        }

        self.poller.wake();
    }

    fn idle(&self) {
        let config = self.scheduler.config();
        let mut events = Events::with_capacity(config.poll_batch);
        let mut expired = Vec::new();

        loop {
            if self.stopping() {
                debug!(scheduler = %self.scheduler.name(), "idle fiber exiting");
                break;
            }

            let timeout = if self.scheduler.has_runnable(Scheduler::current_worker()) {
                0
            } else {
                // Several workers may share one wake-up edge during shutdown,
                // so the ones that miss it re-check the stop condition soon.
                let cap = if self.scheduler.is_stop_requested() {
                    config.max_poll_timeout_ms.min(STOP_POLL_TIMEOUT_MS)
                } else {
                    config.max_poll_timeout_ms
                };
                self.timers.next_timer().map_or(cap, |ms| ms.min(cap))
            };

            if let Err(err) = self.poller.poll(&mut events, timeout) {
                error!(error = %err, "epoll_wait failed");
            }

            self.schedule_expired(&mut expired);

            for ready in events.iter() {
                self.dispatch(ready);
            }

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::Acquire) == 0
            && self.scheduler.is_drained()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("timers", &self.timers.len())
            .field("pending", &self.pending_event_count())
            .finish()
    }
}

/// The running fiber, provided it belongs to a scheduler.
fn scheduled_fiber() -> Result<Arc<Fiber>> {
    let fiber = Fiber::current();
    if fiber.is_main() || Scheduler::current_worker().is_none() {
        return Err(Error::NotInFiber);
    }

    Ok(fiber)
}

fn poller_error(op: &'static str, fd: RawFd, source: std::io::Error) -> Error {
    Error::Poller { op, fd, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn noop() -> Waiter {
        Waiter::Callback(Box::new(|| {}))
    }

    #[test]
    fn stale_token_leaves_a_newer_registration_alone() {
        let iom = IoManager::new(1, false, "tokens").unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let first = iom.register(fd, Event::Read, noop()).unwrap();
        assert!(iom.detach(fd, Event::Read, Some(first)).is_some());

        let second = iom.register(fd, Event::Read, noop()).unwrap();
        assert_ne!(first, second);

        assert!(iom.detach(fd, Event::Read, Some(first)).is_none());
        assert_eq!(iom.pending_event_count(), 1);

        assert!(iom.detach(fd, Event::Read, Some(second)).is_some());
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
    }
}
