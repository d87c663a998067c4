use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};
use std::fmt;
use std::ops::BitOr;

/// Readiness direction a fiber or callback can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub(crate) const ALL: [Event; 2] = [Event::Read, Event::Write];
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => f.write_str("READ"),
            Event::Write => f.write_str("WRITE"),
        }
    }
}

/// Set of registered directions on a descriptor.
///
/// Stored as the matching `EPOLLIN` / `EPOLLOUT` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest(u32);

impl Interest {
    pub(crate) const READ: Interest = Interest(EPOLLIN as u32);
    pub(crate) const WRITE: Interest = Interest(EPOLLOUT as u32);

    /// Maps raw `epoll_event::events` bits to directions.
    ///
    /// An error or hang-up wakes both directions so that every waiter gets
    /// a chance to observe the failure.
    pub(crate) fn from_epoll(events: u32) -> Interest {
        if events & (EPOLLERR | EPOLLHUP) as u32 != 0 {
            return Interest::READ | Interest::WRITE;
        }

        Interest(events & (EPOLLIN | EPOLLOUT) as u32)
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn contains(self, event: Event) -> bool {
        let bit = Interest::from(event).0;
        self.0 & bit == bit
    }

    pub(crate) fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    pub(crate) fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Directions present in the set, read first.
    pub(crate) fn events(self) -> impl Iterator<Item = Event> {
        Event::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl From<Event> for Interest {
    fn from(event: Event) -> Self {
        match event {
            Event::Read => Interest::READ,
            Event::Write => Interest::WRITE,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOr<Event> for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Event) -> Interest {
        self | Interest::from(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hangup_and_error_wake_both_directions() {
        let hup = Interest::from_epoll(EPOLLHUP as u32);
        let err = Interest::from_epoll((EPOLLERR | EPOLLIN) as u32);

        for interest in [hup, err] {
            assert!(interest.contains(Event::Read));
            assert!(interest.contains(Event::Write));
        }
    }

    #[test]
    fn readable_only_maps_to_read() {
        let interest = Interest::from_epoll(EPOLLIN as u32);

        assert!(interest.contains(Event::Read));
        assert!(!interest.contains(Event::Write));
        assert_eq!(interest.events().collect::<Vec<_>>(), vec![Event::Read]);
    }

    #[test]
    fn removing_a_direction_keeps_the_other() {
        let both = Interest::READ | Event::Write;
        let rest = both.without(Interest::READ);

        assert_eq!(rest, Interest::WRITE);
        assert!(rest.without(Interest::WRITE).is_empty());
        assert_eq!(both.intersect(Interest::WRITE), Interest::WRITE);
    }
}
