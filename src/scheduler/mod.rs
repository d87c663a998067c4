//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads and a queue of [`Task`]s.
//! Each worker runs a dispatch loop that pops a task, swaps its fiber in and
//! decides what to do with it once it yields or finishes. When the queue has
//! nothing for a worker, the worker switches into its *idle fiber*.
//!
//! The three hooks that differ between scheduler flavours (`tickle`,
//! `idle`, `stopping`) live on the [`Schedule`] trait. `Scheduler` itself
//! implements it with a condition variable; [`IoManager`](crate::IoManager)
//! embeds a `Scheduler` and replaces the hooks with an epoll wait.

mod context;
mod task;

pub use task::{Task, TaskKind, ThreadHint};

use crate::config::Config;
use crate::error::Result;
use crate::fiber::{self, Fiber, FiberState};

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound on a single condvar wait of the base idle hook.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Delay between the wake-ups `stop` repeats while workers are still running.
const STOP_TICKLE_INTERVAL: Duration = Duration::from_millis(1);

/// Behaviour plugged into the dispatch loop.
///
/// Implementors embed a [`Scheduler`] (built with
/// [`Scheduler::for_driver`]) and expose it through
/// [`scheduler`](Schedule::scheduler). The default hooks are the ones of a
/// plain scheduler.
pub trait Schedule: Send + Sync + 'static {
    /// The shared scheduling core.
    fn scheduler(&self) -> &Scheduler;

    /// Wakes workers blocked in [`idle`](Schedule::idle).
    fn tickle(&self) {
        self.scheduler().notify();
    }

    /// Body of every worker's idle fiber.
    ///
    /// Must yield back to the dispatch loop whenever new work may be
    /// available, and return once [`stopping`](Schedule::stopping) holds.
    fn idle(&self) {
        let scheduler = self.scheduler();

        while !self.stopping() {
            scheduler.park();
            Fiber::yield_to_hold();
        }

        debug!(scheduler = %scheduler.name, "idle fiber exiting");
    }

    /// `true` once the workers may exit.
    fn stopping(&self) -> bool {
        self.scheduler().is_drained()
    }

    /// Upcast used to recover the concrete driver from
    /// [`Scheduler::current`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared state of a fiber scheduler.
pub struct Scheduler {
    name: String,
    config: Config,

    /// The [`Schedule`] implementation embedding this core.
    driver: Weak<dyn Schedule>,

    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,

    /// Total number of workers, the caller thread included.
    worker_count: usize,
    /// Number of OS threads spawned by [`start`](Self::start).
    thread_count: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,

    active: AtomicUsize,
    idle: AtomicUsize,

    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,

    /// Dispatch loop of the constructing thread when `use_caller` is set.
    root_fiber: Option<Arc<Fiber>>,
    root_thread: Option<ThreadId>,
}

impl Scheduler {
    /// Creates a plain scheduler with `threads` workers.
    ///
    /// With `use_caller`, the calling thread counts as worker 0 and only
    /// runs tasks while it is inside [`stop`](Self::stop).
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_config(threads, use_caller, name, Config::default())
    }

    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: Config,
    ) -> Arc<Scheduler> {
        Arc::new_cyclic(|this: &Weak<Scheduler>| {
            let driver: Weak<dyn Schedule> = this.clone();
            Scheduler::for_driver(driver, threads, use_caller, name, config)
        })
    }

    /// Builds the core embedded by a [`Schedule`] implementation.
    ///
    /// `driver` must point at the implementation that will own the returned
    /// value, typically obtained from [`Arc::new_cyclic`].
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0, or if `use_caller` is set on a thread that
    /// already hosts a scheduler.
    pub fn for_driver(
        driver: Weak<dyn Schedule>,
        threads: usize,
        use_caller: bool,
        name: &str,
        config: Config,
    ) -> Scheduler {
        assert!(threads > 0, "worker_threads must be > 0");

        let (root_fiber, root_thread, thread_count) = if use_caller {
            assert!(
                context::current_scheduler().is_none(),
                "this thread already hosts a scheduler"
            );

            // The caller becomes worker 0; its loop only runs once `stop`
            // enters the root fiber.
            let _ = Fiber::current();
            context::enter(driver.clone(), Some(0));

            let weak = driver.clone();
            let root = Fiber::scheduler_entry(
                Box::new(move || {
                    if let Some(driver) = weak.upgrade() {
                        run(driver, 0);
                    }
                }),
                config.stack_size,
            );

            (Some(root), Some(thread::current().id()), threads - 1)
        } else {
            (None, None, threads)
        };

        Scheduler {
            name: name.to_string(),
            config,
            driver,
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            worker_count: threads,
            thread_count,
            threads: Mutex::new(Vec::with_capacity(thread_count)),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            root_fiber,
            root_thread,
        }
    }

    /// The scheduler driving the calling thread, if any.
    pub fn current() -> Option<Arc<dyn Schedule>> {
        context::current_scheduler()
    }

    /// Index of the worker running on the calling thread.
    pub fn current_worker() -> Option<usize> {
        context::current_worker()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Total number of workers, the caller thread included.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of workers currently running a task.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of workers currently inside their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle_count() > 0
    }

    /// Number of tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Spawns the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(driver) = self.driver.upgrade() else {
            return Ok(());
        };

        let first = self.worker_count - self.thread_count;
        let mut threads = self.threads.lock();

        for id in first..self.worker_count {
            let driver = driver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || run(driver, id))?;

            threads.push(handle);
        }

        debug!(scheduler = %self.name, workers = self.worker_count, "scheduler started");

        Ok(())
    }

    /// Queues `task` and wakes a worker. Never blocks on the task itself.
    pub fn schedule(&self, task: impl Into<Task>) {
        self.queue.lock().push_back(task.into());
        self.tickle();
    }

    /// Queues `task` for the worker with index `worker` only.
    pub fn schedule_on(&self, task: impl Into<Task>, worker: usize) {
        self.schedule(task.into().pinned(worker));
    }

    /// Queues every task of `tasks` under a single lock acquisition.
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        let added = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(Into::into));
            queue.len() > before
        };

        if added {
            self.tickle();
        }
    }

    /// Queues `callback` to run once in a fiber.
    pub fn spawn<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::callback(callback));
    }

    /// Waits for the queue to drain and for every worker to exit.
    ///
    /// With `use_caller`, this must run on the constructing thread, which
    /// takes part in draining the queue. Otherwise it must not run on one
    /// of this scheduler's workers. Workers keep the scheduler alive until
    /// this is called.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        let driver = self.driver.upgrade();

        if let Some(root) = &self.root_fiber {
            assert_eq!(
                Some(thread::current().id()),
                self.root_thread,
                "a use_caller scheduler must be stopped from the thread that built it"
            );

            if self.thread_count == 0
                && matches!(root.state(), FiberState::Init | FiberState::Term)
            {
                self.stopping.store(true, Ordering::Release);

                if driver.as_ref().is_some_and(|d| d.stopping()) {
                    context::leave();
                    return;
                }
            }
        } else {
            assert!(
                context::current_scheduler().is_none_or(|d| !ptr::eq(d.scheduler(), self)),
                "a scheduler cannot be stopped from one of its own workers"
            );
        }

        self.stopping.store(true, Ordering::Release);
        debug!(scheduler = %self.name, "scheduler stopping");

        if let Some(driver) = &driver {
            for _ in 0..self.worker_count {
                driver.tickle();
            }
        }

        if let Some(root) = &self.root_fiber {
            let pending = driver.as_ref().is_some_and(|d| !d.stopping());
            if pending && root.state() == FiberState::Init {
                root.call();
            }

            context::leave();
        }

        // Coalesced wake-ups may reach only some of the idle workers, so keep
        // nudging until every thread has left its dispatch loop.
        let threads = std::mem::take(&mut *self.threads.lock());
        while threads.iter().any(|handle| !handle.is_finished()) {
            if let Some(driver) = &driver {
                driver.tickle();
            }
            thread::sleep(STOP_TICKLE_INTERVAL);
        }

        for handle in threads {
            let _ = handle.join();
        }

        debug!(scheduler = %self.name, "scheduler stopped");
    }

    /// Base stop condition: stop requested, queue drained, nothing running.
    pub fn is_drained(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    /// `true` once [`stop`](Self::stop) has been called.
    pub fn is_stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Wakes every worker parked by the base idle hook.
    pub fn notify(&self) {
        self.condvar.notify_all();
    }

    /// Blocks the calling worker for a bounded time unless it has something
    /// to run.
    pub fn park(&self) {
        let worker = context::current_worker();
        let mut queue = self.queue.lock();

        if runnable(&queue, worker) {
            return;
        }

        let _ = self.condvar.wait_for(&mut queue, PARK_TIMEOUT);
    }

    /// `true` if the queue holds a task `worker` could run right now.
    pub fn has_runnable(&self, worker: Option<usize>) -> bool {
        runnable(&self.queue.lock(), worker)
    }

    pub(crate) fn driver(&self) -> Option<Arc<dyn Schedule>> {
        self.driver.upgrade()
    }

    fn tickle(&self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.tickle();
        }
    }

    /// Removes the first task `worker` may run now.
    ///
    /// The second value asks for a tickle: some task was left behind for
    /// another worker, or more work remains.
    fn take(&self, worker: usize) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle_me = false;

        let position = queue.iter().position(|task| {
            let eligible = task.runs_on(worker) && !task.is_busy();
            tickle_me |= !eligible;
            eligible
        });

        let task = position.and_then(|index| queue.remove(index));
        if task.is_some() {
            self.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= !queue.is_empty();
        }

        (task, tickle_me)
    }

    fn requeue(&self, fiber: Arc<Fiber>, hint: ThreadHint) {
        self.schedule(Task::fiber(fiber).with_hint(hint));
    }
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("stopping", &self.is_stop_requested())
            .finish()
    }
}

fn runnable(queue: &VecDeque<Task>, worker: Option<usize>) -> bool {
    queue
        .iter()
        .any(|task| worker.is_none_or(|w| task.runs_on(w)) && !task.is_busy())
}

/// Dispatch loop of worker `worker`.
fn run(driver: Arc<dyn Schedule>, worker: usize) {
    let scheduler = driver.scheduler();

    context::enter(Arc::downgrade(&driver), Some(worker));
    fiber::set_scheduling_fiber(Some(&Fiber::current()));
    debug!(scheduler = %scheduler.name, worker, "worker started");

    let idle_fiber = {
        let driver = driver.clone();
        Fiber::from_body(Box::new(move || driver.idle()), scheduler.config.stack_size)
    };

    // Finished callback fiber kept around so the next callback reuses its
    // stack.
    let mut spare: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_me) = scheduler.take(worker);
        if tickle_me {
            driver.tickle();
        }

        let Some(task) = task else {
            if idle_fiber.state().is_finished() {
                break;
            }

            // Counted idle before the idle hook looks at the queue, so a
            // concurrent `schedule` either sees this worker idle or its task
            // is seen by the hook.
            scheduler.idle.fetch_add(1, Ordering::SeqCst);
            idle_fiber.swap_in();
            scheduler.idle.fetch_sub(1, Ordering::SeqCst);
            continue;
        };

        let hint = task.hint;
        match task.kind {
            TaskKind::Fiber(fiber) => {
                if fiber.state().is_finished() {
                    scheduler.active.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }

                trace!(worker, fiber = fiber.id(), "resuming fiber");
                let state = fiber.swap_in();
                scheduler.active.fetch_sub(1, Ordering::AcqRel);

                if state == FiberState::Ready {
                    scheduler.requeue(fiber, hint);
                }
            }
            TaskKind::Callback(callback) => {
                let fiber = match spare.take() {
                    Some(fiber) => {
                        fiber.reset_body(callback);
                        fiber
                    }
                    None => Fiber::from_body(callback, scheduler.config.stack_size),
                };

                trace!(worker, fiber = fiber.id(), "running callback");
                let state = fiber.swap_in();
                scheduler.active.fetch_sub(1, Ordering::AcqRel);

                match state {
                    FiberState::Ready => scheduler.requeue(fiber, hint),
                    FiberState::Term | FiberState::Except => spare = Some(fiber),
                    _ => {}
                }
            }
        }
    }

    drop(spare);
    drop(idle_fiber);

    fiber::set_scheduling_fiber(None);
    context::leave();
    debug!(scheduler = %scheduler.name, worker, "worker exited");
}
