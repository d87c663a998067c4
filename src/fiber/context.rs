use super::stack::Stack;

use libc::{getcontext, makecontext, swapcontext, ucontext_t};
use std::cell::UnsafeCell;
use std::{io, mem, ptr};
use tracing::error;

/// A saved execution context.
///
/// The `ucontext_t` lives in its own heap allocation because glibc stores
/// pointers into the structure itself (the floating point save area), so
/// it must never move once captured.
pub(crate) struct Context {
    uc: Box<UnsafeCell<ucontext_t>>,
}

impl Context {
    /// An empty slot, filled in by the first switch away from it.
    ///
    /// Used by thread main fibers, which already run on the thread stack.
    pub(crate) fn empty() -> Self {
        Self {
            uc: Box::new(UnsafeCell::new(unsafe { mem::zeroed() })),
        }
    }

    /// A context that starts `entry` on `stack` when first switched to.
    pub(crate) fn with_stack(stack: &Stack, entry: extern "C" fn()) -> Self {
        let context = Self::empty();
        context.prepare(stack, entry);
        context
    }

    /// Points the context back at the beginning of `entry` on `stack`.
    ///
    /// Must not be called while the context is running.
    pub(crate) fn prepare(&self, stack: &Stack, entry: extern "C" fn()) {
        let uc = self.uc.get();

        unsafe {
            if getcontext(uc) != 0 {
                fatal("getcontext");
            }

            (*uc).uc_link = ptr::null_mut();
            (*uc).uc_stack.ss_sp = stack.bottom();
            (*uc).uc_stack.ss_size = stack.size();
            (*uc).uc_stack.ss_flags = 0;

            makecontext(uc, entry, 0);
        }
    }

    /// Saves the running context into `from` and resumes `to`.
    ///
    /// Returns once something switches back into `from`.
    ///
    /// # Safety
    ///
    /// `to` must have been prepared or saved by an earlier switch, and must
    /// not be running on any thread.
    pub(crate) unsafe fn switch(from: &Context, to: &Context) {
        if unsafe { swapcontext(from.uc.get(), to.uc.get()) } != 0 {
            fatal("swapcontext");
        }
    }
}

/// A failed context operation leaves the thread without a valid stack to
/// return to.
fn fatal(op: &str) -> ! {
    error!(op, error = %io::Error::last_os_error(), "context switch failed");
    std::process::abort();
}
