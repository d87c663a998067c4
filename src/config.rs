//! Runtime configuration.

/// Stack size used when a fiber is created without an explicit size.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Upper bound on a single readiness wait, in milliseconds.
pub const DEFAULT_MAX_POLL_TIMEOUT_MS: u64 = 5000;

/// Tunables shared by the scheduler and the I/O manager.
///
/// Every field has a sensible default; override only what matters:
///
/// ```rust,ignore
/// let config = Config::new().stack_size(256 * 1024).max_poll_timeout_ms(1000);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Stack size of the fibers created to run scheduled callbacks.
    pub stack_size: usize,
    /// Hard cap on how long an idle worker blocks in `epoll_wait`.
    pub max_poll_timeout_ms: u64,
    /// Maximum number of readiness events collected per wait.
    pub poll_batch: usize,
    /// Initial number of slots in the descriptor table.
    pub fd_table_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_poll_timeout_ms: DEFAULT_MAX_POLL_TIMEOUT_MS,
            poll_batch: 256,
            fd_table_size: 32,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(self, stack_size: usize) -> Self {
        Self { stack_size, ..self }
    }

    pub fn max_poll_timeout_ms(self, max_poll_timeout_ms: u64) -> Self {
        Self {
            max_poll_timeout_ms,
            ..self
        }
    }

    pub fn poll_batch(self, poll_batch: usize) -> Self {
        Self {
            poll_batch: poll_batch.max(1),
            ..self
        }
    }

    pub fn fd_table_size(self, fd_table_size: usize) -> Self {
        Self {
            fd_table_size,
            ..self
        }
    }
}
