use super::Schedule;

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

thread_local! {
    /// Scheduler driving the current thread.
    ///
    /// Set when a worker starts (and on the thread that built a scheduler
    /// with `use_caller`), cleared when the worker exits. Held weakly so a
    /// forgotten scheduler does not outlive its last user.
    static CURRENT_SCHEDULER: RefCell<Option<Weak<dyn Schedule>>> =
        const { RefCell::new(None) };

    /// Index of the worker running on this thread.
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

// Fibers read these after migrating between workers, so the accessors are
// kept out of line like the fiber thread-locals.

/// Installs `driver` as the scheduler of the calling thread.
#[inline(never)]
pub(crate) fn enter(driver: Weak<dyn Schedule>, worker: Option<usize>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(driver));
    CURRENT_WORKER.with(|w| w.set(worker));
}

/// Clears the scheduler of the calling thread.
#[inline(never)]
pub(crate) fn leave() {
    let _ = CURRENT_SCHEDULER.try_with(|s| s.borrow_mut().take());
    let _ = CURRENT_WORKER.try_with(|w| w.set(None));
}

#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    CURRENT_SCHEDULER
        .try_with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
        .ok()
        .flatten()
}

#[inline(never)]
pub(crate) fn current_worker() -> Option<usize> {
    CURRENT_WORKER.try_with(|w| w.get()).ok().flatten()
}
