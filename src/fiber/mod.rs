//! Stackful coroutines.
//!
//! A [`Fiber`] owns its own stack and saved execution context. It runs
//! until it explicitly gives control back, either by yielding or by
//! returning from its body; nothing ever preempts it.
//!
//! Every OS thread that touches fibers has a *main fiber* standing for the
//! code already running on the thread stack. Worker threads additionally
//! record a *scheduling fiber*, the context that [`Fiber::swap_in`]
//! switches away from and [`Fiber::swap_out`] returns to.
//!
//! ```rust,ignore
//! let fiber = Fiber::new(|| {
//!     println!("first");
//!     Fiber::yield_to_hold();
//!     println!("second");
//! });
//!
//! fiber.swap_in(); // prints "first"
//! fiber.swap_in(); // prints "second"
//! assert_eq!(fiber.state(), FiberState::Term);
//! ```

mod context;
mod stack;
mod state;

pub use state::FiberState;

use crate::config::DEFAULT_STACK_SIZE;
use context::Context;
use stack::Stack;

use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Body run by a fiber.
pub type FiberBody = Box<dyn FnOnce() + Send + 'static>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Fiber currently executing on this thread.
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// Main fiber of this thread, created on first use.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Context that `swap_in` leaves and `swap_out` returns to.
    ///
    /// Null outside of a scheduler, in which case the main fiber is used.
    static SCHEDULING_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

// A fiber may migrate between workers whenever it is suspended. These
// accessors are never inlined so the thread-local address is recomputed
// after every switch instead of being cached across it.

#[inline(never)]
fn current_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
fn set_current(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
fn thread_fiber() -> *const Fiber {
    if let Some(fiber) = THREAD_FIBER.with(|t| t.borrow().as_ref().map(Arc::as_ptr)) {
        return fiber;
    }

    let main = Fiber::thread_main();
    let raw = Arc::as_ptr(&main);
    THREAD_FIBER.with(|t| *t.borrow_mut() = Some(main));

    if current_ptr().is_null() {
        set_current(raw);
    }

    raw
}

#[inline(never)]
fn scheduling_fiber() -> *const Fiber {
    let fiber = SCHEDULING_FIBER.with(|s| s.get());
    if fiber.is_null() { thread_fiber() } else { fiber }
}

/// Installs the context that fibers on this thread return to.
///
/// Passing `None` falls back to the thread main fiber.
#[inline(never)]
pub(crate) fn set_scheduling_fiber(fiber: Option<&Arc<Fiber>>) {
    let raw = fiber.map_or(ptr::null(), Arc::as_ptr);
    SCHEDULING_FIBER.with(|s| s.set(raw));
}

/// A stackful coroutine.
pub struct Fiber {
    /// Unique id; `0` for thread main fibers.
    id: u64,

    /// Current [`FiberState`], stored as its discriminant.
    state: AtomicU8,

    /// Set while a thread is executing the fiber or still switching out of
    /// it. A fiber must not be resumed elsewhere until this is cleared.
    on_cpu: AtomicBool,

    /// Scheduler entry fibers finish with [`back`](Self::back) instead of
    /// [`swap_out`](Self::swap_out).
    returns_to_thread: bool,

    context: Context,

    /// `None` for thread main fibers.
    stack: Option<Stack>,

    body: Mutex<Option<FiberBody>>,

    /// Message of the panic that ended the body, if any.
    panic: Mutex<Option<String>>,

    this: Weak<Fiber>,
}

// The context and stack are raw memory only touched by the thread currently
// running the fiber; `on_cpu` and the scheduler queue serialize that access.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber running `body` on a stack of the default size.
    pub fn new<F>(body: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(body), DEFAULT_STACK_SIZE, false)
    }

    /// Creates a fiber with an explicit stack size.
    ///
    /// A size of `0` selects [`DEFAULT_STACK_SIZE`].
    pub fn with_stack_size<F>(body: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(body), stack_size, false)
    }

    pub(crate) fn from_body(body: FiberBody, stack_size: usize) -> Arc<Fiber> {
        Self::build(body, stack_size, false)
    }

    /// A fiber that hands control back to the thread main fiber when its
    /// body ends. Used to run a dispatch loop on the thread that built the
    /// scheduler.
    pub(crate) fn scheduler_entry(body: FiberBody, stack_size: usize) -> Arc<Fiber> {
        Self::build(body, stack_size, true)
    }

    fn build(body: FiberBody, stack_size: usize, returns_to_thread: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = Stack::new(stack_size);
        let context = Context::with_stack(&stack, fiber_entry);

        let fiber = Arc::new_cyclic(|this| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            on_cpu: AtomicBool::new(false),
            returns_to_thread,
            context,
            stack: Some(stack),
            body: Mutex::new(Some(body)),
            panic: Mutex::new(None),
            this: this.clone(),
        });

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!(fiber = fiber.id, stack_size, "fiber created");

        fiber
    }

    /// The main fiber of the calling thread.
    fn thread_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        Arc::new_cyclic(|this| Fiber {
            id: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            on_cpu: AtomicBool::new(true),
            returns_to_thread: false,
            context: Context::empty(),
            stack: None,
            body: Mutex::new(None),
            panic: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Returns the fiber running on this thread.
    ///
    /// Outside of any fiber this is the thread main fiber, created on the
    /// first call.
    pub fn current() -> Arc<Fiber> {
        let raw = current_ptr();
        let raw = if raw.is_null() { thread_fiber() } else { raw };

        unsafe { &*raw }.handle()
    }

    /// Id of the running fiber, `0` on a thread main fiber or outside any.
    pub fn current_id() -> u64 {
        let raw = current_ptr();
        if raw.is_null() { 0 } else { unsafe { (*raw).id } }
    }

    /// Number of fibers currently alive, main fibers included.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `true` while a thread is running the fiber or switching out of it.
    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    /// `true` for a thread main fiber.
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// The panic message that moved the fiber to [`FiberState::Except`].
    pub fn panic_message(&self) -> Option<String> {
        self.panic.lock().clone()
    }

    fn handle(&self) -> Arc<Fiber> {
        self.this
            .upgrade()
            .expect("a running fiber is always referenced by its resumer")
    }

    /// Replaces the body of a finished or never-run fiber, reusing its stack.
    ///
    /// # Panics
    ///
    /// Panics unless the state is `Init`, `Term` or `Except`, or if called
    /// on a thread main fiber.
    pub fn reset<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_body(Box::new(body));
    }

    pub(crate) fn reset_body(&self, body: FiberBody) {
        let stack = self
            .stack
            .as_ref()
            .expect("a thread main fiber cannot be reset");

        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "fiber {} cannot be reset from {}",
            self.id,
            state
        );
        assert!(!self.is_on_cpu(), "fiber {} is still running", self.id);

        *self.body.lock() = Some(body);
        *self.panic.lock() = None;
        self.context.prepare(stack, fiber_entry);
        self.set_state(FiberState::Init);
    }

    /// Switches from the scheduling fiber of this thread into this fiber.
    ///
    /// Returns once the fiber yields, finishes or swaps out, with the state
    /// it left in. A fiber that swapped out without yielding is moved to
    /// `Hold`.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not resumable (`Exec`, `Term`, `Except`) or is
    /// a thread main fiber.
    pub fn swap_in(&self) -> FiberState {
        self.resume_from(scheduling_fiber())
    }

    /// Switches from the thread main fiber into this fiber.
    pub fn call(&self) -> FiberState {
        self.resume_from(thread_fiber())
    }

    fn resume_from(&self, from: *const Fiber) -> FiberState {
        assert!(!self.is_main(), "a thread main fiber cannot be resumed");
        assert!(
            ptr::eq(current_ptr(), from),
            "fiber {} must be resumed from its scheduling context",
            self.id
        );

        let state = self.state();
        assert!(
            state.is_resumable(),
            "fiber {} cannot be resumed from {}",
            self.id,
            state
        );
        assert!(
            !self.on_cpu.swap(true, Ordering::AcqRel),
            "fiber {} is already running",
            self.id
        );

        self.set_state(FiberState::Exec);
        set_current(self);

        unsafe { Context::switch(&(*from).context, &self.context) };

        if self.state() == FiberState::Exec {
            self.set_state(FiberState::Hold);
        }

        let state = self.state();
        self.on_cpu.store(false, Ordering::Release);

        state
    }

    /// Switches from this fiber back to the scheduling fiber of this thread.
    ///
    /// # Panics
    ///
    /// Panics unless this is the fiber currently running.
    pub fn swap_out(&self) {
        self.leave_to(scheduling_fiber());
    }

    /// Switches from this fiber back to the thread main fiber.
    pub fn back(&self) {
        self.leave_to(thread_fiber());
    }

    fn leave_to(&self, to: *const Fiber) {
        assert!(
            ptr::eq(current_ptr(), self),
            "fiber {} is not the running fiber",
            self.id
        );

        set_current(to);
        unsafe { Context::switch(&self.context, &(*to).context) };
    }

    fn leave(&self) {
        if self.returns_to_thread {
            self.back();
        } else {
            self.swap_out();
        }
    }

    /// Suspends the running fiber and marks it `Ready`, so the scheduler
    /// queues it again straight away.
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Suspends the running fiber and marks it `Hold`; something else must
    /// reschedule it.
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    fn yield_with(state: FiberState) {
        let raw = current_ptr();
        assert!(!raw.is_null(), "yield called outside of a fiber");

        let fiber = unsafe { &*raw };
        assert!(!fiber.is_main(), "a thread main fiber cannot yield");
        assert_eq!(
            fiber.state(),
            FiberState::Exec,
            "only an executing fiber may yield"
        );

        fiber.set_state(state);
        fiber.leave();
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);

        if self.is_main() {
            let _ = CURRENT_FIBER.try_with(|c| {
                if ptr::eq(c.get(), self) {
                    c.set(ptr::null());
                }
            });
            return;
        }

        let state = self.state();
        if !matches!(state, FiberState::Init | FiberState::Term | FiberState::Except) {
            warn!(fiber = self.id, %state, "dropping a suspended fiber, its stack is freed without unwinding");
        }

        debug!(fiber = self.id, "fiber dropped");
    }
}

/// First function executed on every fiber stack.
extern "C" fn fiber_entry() {
    let fiber = run_body();

    // Everything owned by the body is dropped by now; only the raw pointer
    // survives so the last reference stays with whoever resumed us.
    unsafe { (*fiber).leave() };

    error!(fiber = unsafe { (*fiber).id }, "finished fiber was resumed");
    std::process::abort();
}

fn run_body() -> *const Fiber {
    let current = Fiber::current();
    let body = current.body.lock().take();

    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(body) = body {
            body();
        }
    }));

    match result {
        Ok(()) => current.set_state(FiberState::Term),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                fiber = current.id,
                %message,
                backtrace = %Backtrace::capture(),
                "fiber panicked"
            );

            *current.panic.lock() = Some(message);
            current.set_state(FiberState::Except);
        }
    }

    Arc::as_ptr(&current)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
