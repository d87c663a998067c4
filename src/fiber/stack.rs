use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, MAP_STACK, PROT_NONE, PROT_READ, PROT_WRITE,
    _SC_PAGESIZE, c_void, mmap, mprotect, munmap, sysconf,
};
use std::io;
use std::ptr;
use tracing::error;

/// Smallest usable stack handed to a fiber.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

/// An exclusively-owned fiber stack.
///
/// The mapping is one guard page followed by the usable area; the guard
/// sits at the low end because stacks grow downwards, so an overflow
/// faults instead of corrupting a neighbouring allocation.
pub(crate) struct Stack {
    /// Start of the whole mapping (guard page included).
    base: *mut c_void,

    /// Length of the whole mapping.
    len: usize,

    /// Size of the page used for the guard.
    page: usize,
}

// The mapping is owned by exactly one fiber and only touched by the thread
// currently running it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Maps a new stack with at least `size` usable bytes.
    ///
    /// A fiber cannot run without a stack, so failure to map one aborts
    /// the process.
    pub(crate) fn new(size: usize) -> Self {
        let page = page_size();
        let usable = round_up(size.max(MIN_STACK_SIZE), page);
        let len = usable + page;

        let base = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_STACK,
                -1,
                0,
            )
        };

        if base == MAP_FAILED {
            error!(size = len, error = %io::Error::last_os_error(), "failed to map fiber stack");
            std::process::abort();
        }

        if unsafe { mprotect(base, page, PROT_NONE) } != 0 {
            error!(error = %io::Error::last_os_error(), "failed to protect fiber stack guard page");
            std::process::abort();
        }

        Self { base, len, page }
    }

    /// Lowest usable address, as expected by `uc_stack.ss_sp`.
    pub(crate) fn bottom(&self) -> *mut c_void {
        unsafe { (self.base as *mut u8).add(self.page) as *mut c_void }
    }

    /// Number of usable bytes.
    pub(crate) fn size(&self) -> usize {
        self.len - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base, self.len);
        }
    }
}

fn page_size() -> usize {
    let page = unsafe { sysconf(_SC_PAGESIZE) };
    if page <= 0 { 4096 } else { page as usize }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_is_page_aligned() {
        let page = page_size();
        let stack = Stack::new(MIN_STACK_SIZE + 1);

        assert_eq!(stack.size() % page, 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn test_stack_respects_minimum() {
        let stack = Stack::new(1);
        assert!(stack.size() >= MIN_STACK_SIZE);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(MIN_STACK_SIZE);
        let bottom = stack.bottom() as *mut u8;

        unsafe {
            bottom.write(0xAB);
            bottom.add(stack.size() - 1).write(0xCD);
            assert_eq!(bottom.read(), 0xAB);
        }
    }
}
