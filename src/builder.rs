use crate::config::Config;
use crate::error::Result;
use crate::reactor::IoManager;
use crate::scheduler::Scheduler;

use std::sync::Arc;
use std::thread;

/// Configures and creates a [`Scheduler`] or an [`IoManager`].
///
/// ```rust,ignore
/// let iom = Builder::new()
///     .worker_threads(4)
///     .name("io")
///     .config(Config::new().max_poll_timeout_ms(1000))
///     .build_io_manager()?;
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    worker_threads: usize,
    use_caller: bool,
    name: String,
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        let worker_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            worker_threads,
            use_caller: false,
            name: "spindle".to_string(),
            config: Config::default(),
        }
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be > 0");

        self.worker_threads = n;
        self
    }

    /// Makes the building thread worker 0.
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    /// Prefix of the worker thread names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Builds a plain scheduler. Workers are spawned by
    /// [`Scheduler::start`].
    pub fn build_scheduler(self) -> Arc<Scheduler> {
        Scheduler::with_config(self.worker_threads, self.use_caller, &self.name, self.config)
    }

    /// Builds and starts an I/O manager.
    pub fn build_io_manager(self) -> Result<Arc<IoManager>> {
        IoManager::with_config(self.worker_threads, self.use_caller, &self.name, self.config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
