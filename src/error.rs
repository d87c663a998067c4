//! Error types returned by the runtime.

use crate::reactor::Event;

use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Errors reported to callers of the scheduler and I/O manager.
///
/// Programming errors such as resuming a running fiber are not represented
/// here; they trip assertions instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The direction is already being waited on for this descriptor.
    #[error("{event} interest already registered on fd {fd}")]
    AlreadyRegistered {
        /// Descriptor the registration targeted.
        fd: RawFd,
        /// Direction that was already registered.
        event: Event,
    },

    /// An `epoll_ctl` call was rejected by the kernel.
    #[error("epoll_ctl({op}) failed for fd {fd}: {source}")]
    Poller {
        /// Name of the control operation (`ADD`, `MOD`, `DEL`).
        op: &'static str,
        /// Descriptor the operation targeted.
        fd: RawFd,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Negative or otherwise unusable descriptor.
    #[error("invalid file descriptor {0}")]
    InvalidFd(RawFd),

    /// The operation must be called from inside a scheduled fiber.
    #[error("not running inside a scheduled fiber")]
    NotInFiber,

    /// No live scheduler is left to resume the waiter.
    #[error("no scheduler available to run the waiter")]
    NoScheduler,

    /// A wait was cut short by its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The fiber producing a result terminated without one.
    #[error("fiber terminated before producing a result")]
    Aborted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_scheduler_is_not_reported_as_an_abort() {
        let message = Error::NoScheduler.to_string();

        assert_eq!(message, "no scheduler available to run the waiter");
        assert_ne!(message, Error::Aborted.to_string());
    }
}
