use crate::fiber::{Fiber, FiberBody};

use std::fmt;
use std::sync::Arc;

/// Where a task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadHint {
    /// Any worker may pick the task up.
    #[default]
    Any,
    /// Only the worker with this index may run the task.
    Worker(usize),
}

/// What a task runs.
pub enum TaskKind {
    /// An existing fiber, resumed where it left off.
    Fiber(Arc<Fiber>),
    /// A one-shot closure, run inside a fiber owned by the worker.
    Callback(FiberBody),
}

/// A unit of work in the scheduler queue.
///
/// Tasks pinned to a worker run in the order they were scheduled on that
/// worker; unpinned tasks carry no ordering guarantee.
pub struct Task {
    pub(crate) kind: TaskKind,
    pub(crate) hint: ThreadHint,
}

impl Task {
    /// A task resuming `fiber`.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self {
            kind: TaskKind::Fiber(fiber),
            hint: ThreadHint::Any,
        }
    }

    /// A task running `callback` once.
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: TaskKind::Callback(Box::new(callback)),
            hint: ThreadHint::Any,
        }
    }

    /// Restricts the task to the worker with index `worker`.
    pub fn pinned(self, worker: usize) -> Self {
        self.with_hint(ThreadHint::Worker(worker))
    }

    pub fn with_hint(self, hint: ThreadHint) -> Self {
        Self { hint, ..self }
    }

    pub fn hint(&self) -> ThreadHint {
        self.hint
    }

    /// `true` if `worker` is allowed to run this task.
    pub(crate) fn runs_on(&self, worker: usize) -> bool {
        match self.hint {
            ThreadHint::Any => true,
            ThreadHint::Worker(id) => id == worker,
        }
    }

    /// `true` while the task's fiber is still executing or switching out on
    /// some worker.
    pub(crate) fn is_busy(&self) -> bool {
        match &self.kind {
            TaskKind::Fiber(fiber) => fiber.is_on_cpu(),
            TaskKind::Callback(_) => false,
        }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::fiber(fiber)
    }
}

impl From<FiberBody> for Task {
    fn from(callback: FiberBody) -> Self {
        Self {
            kind: TaskKind::Callback(callback),
            hint: ThreadHint::Any,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            TaskKind::Fiber(fiber) => format!("Fiber({})", fiber.id()),
            TaskKind::Callback(_) => "Callback".to_string(),
        };

        f.debug_struct("Task")
            .field("kind", &kind)
            .field("hint", &self.hint)
            .finish()
    }
}
