//! # Spindle
//!
//! **Spindle** is an M:N fiber runtime for Linux: stackful coroutines
//! multiplexed over a pool of OS worker threads, with an `epoll` driven
//! I/O manager and deadline timers folded into the same wait loop.
//!
//! Fibers are cooperative. A fiber keeps its worker until it yields,
//! finishes, or suspends waiting for a descriptor or a timer; nothing
//! preempts it. Code running in a fiber is ordinary blocking-style Rust,
//! no `async` involved.
//!
//! Spindle provides:
//!
//! - **Fibers** with their own guarded stacks, built on `ucontext`
//! - A **scheduler** with optional per-worker pinning of tasks
//! - An **I/O manager** that parks fibers until a descriptor is ready
//! - **Timers**, one-shot or recurring, optionally tied to a weak guard
//! - **Entry-point macros** `#[spindle::main]` and `#[spindle::test]`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spindle::IoManager;
//!
//! #[spindle::main(worker_threads = 2)]
//! fn main() {
//!     let iom = IoManager::current().unwrap();
//!
//!     iom.spawn(|| println!("hello from a fiber"));
//!     iom.sleep_ms(100).unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`fiber`]: Stackful coroutines
//! - [`scheduler`]: Worker pool and task queue
//! - [`timer`]: Deadline-ordered callbacks
//! - [`reactor`]: Descriptor readiness on top of the scheduler
//! - [`fd_manager`]: Per-descriptor metadata

mod builder;
mod config;
mod error;
mod sys;

pub mod fd_manager;
pub mod fiber;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use builder::Builder;
pub use config::{Config, DEFAULT_MAX_POLL_TIMEOUT_MS, DEFAULT_STACK_SIZE};
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, IoManager};
pub use scheduler::{Schedule, Scheduler, Task, ThreadHint};
pub use timer::{Timer, TimerManager};

pub use spindle_macros::*;
