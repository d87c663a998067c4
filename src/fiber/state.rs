use std::fmt;

/// Lifecycle state of a fiber.
///
/// ```text
/// Init -> Exec -> { Ready, Hold } -> Exec -> { Term, Except }
/// ```
///
/// `Term` and `Except` are terminal; only [`Fiber::reset`](super::Fiber::reset)
/// leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never run.
    Init = 0,
    /// Suspended, waiting for something else to reschedule it.
    Hold = 1,
    /// Currently executing on a worker.
    Exec = 2,
    /// The body returned.
    Term = 3,
    /// Suspended and already eligible to run again.
    Ready = 4,
    /// The body panicked.
    Except = 5,
}

impl FiberState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }

    /// `true` for the states a fiber may be resumed from.
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }

    /// `true` once the body has finished, normally or not.
    pub fn is_finished(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        };

        f.write_str(name)
    }
}
