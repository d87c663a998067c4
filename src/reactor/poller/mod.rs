//! Readiness polling backend.
//!
//! Only Linux `epoll` is supported; the I/O manager relies on its
//! edge-triggered mode and on several threads waiting on the same
//! instance concurrently.

mod epoll;

pub(crate) use epoll::{EpollPoller as Poller, Events, Readiness};
