//! Core types for the event-driver reactor.

use std::os::unix::io::RawFd;
use std::time::Instant;

bitflags::bitflags! {
    /// Interest mask for a registered file descriptor.
    ///
    /// Each bit selects one readiness category. A registration may carry
    /// any non-empty combination; the reactor keeps at most one handler
    /// per (fd, category) pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u8 {
        /// The descriptor can be read without blocking (or has hung up).
        const READABLE = 1 << 0;
        /// The descriptor can be written without blocking.
        const WRITABLE = 1 << 1;
        /// The descriptor is in an error state.
        const ERRORED = 1 << 2;
    }
}

/// Readiness category of a single dispatched event.
///
/// `Read`, `Write` and `Error` correspond to the bits of [`EventMask`];
/// `Timer` marks deadline and idle-timeout callbacks. The derived
/// ordering (`Read < Write < Error`) is the rotation order of the
/// reactor's round-robin cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// Data (or EOF) is available to read.
    Read,
    /// The descriptor accepts writes.
    Write,
    /// The descriptor reported an error condition.
    Error,
    /// A timer deadline or the idle timeout expired.
    Timer,
}

impl Category {
    /// The fd-event categories in cursor rotation order.
    pub(crate) const FD_CATEGORIES: [Category; 3] =
        [Category::Read, Category::Write, Category::Error];

    /// The interest bit selecting this category, if it is an fd category.
    pub fn mask_bit(&self) -> Option<EventMask> {
        match self {
            Category::Read => Some(EventMask::READABLE),
            Category::Write => Some(EventMask::WRITABLE),
            Category::Error => Some(EventMask::ERRORED),
            Category::Timer => None,
        }
    }
}

/// Identifies what an event was raised for: a descriptor, or the timer
/// sentinel for deadline/idle callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventToken {
    /// The file descriptor that became ready.
    Fd(RawFd),
    /// A timer or idle-timeout event; no descriptor is involved.
    Timer,
}

impl EventToken {
    /// The raw descriptor, if this token names one.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            EventToken::Fd(fd) => Some(*fd),
            EventToken::Timer => None,
        }
    }
}

/// Per-invocation context handed to a handler.
///
/// Populated by the reactor immediately before the call: the source of
/// the event, its category, and the timestamp taken when the readiness
/// poll returned (timers carry their fire time instead).
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    /// What the event was raised for.
    pub token: EventToken,
    /// The readiness category that fired.
    pub category: Category,
    /// When the readiness poll returned (or the timer fired).
    pub at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask_bits() {
        let mask = EventMask::READABLE | EventMask::WRITABLE;
        assert!(mask.contains(EventMask::READABLE));
        assert!(mask.contains(EventMask::WRITABLE));
        assert!(!mask.contains(EventMask::ERRORED));
    }

    #[test]
    fn test_event_mask_from_bits() {
        assert_eq!(EventMask::from_bits(0b001), Some(EventMask::READABLE));
        assert_eq!(
            EventMask::from_bits(0b111),
            Some(EventMask::READABLE | EventMask::WRITABLE | EventMask::ERRORED)
        );
        // Unrecognized bits are not representable.
        assert_eq!(EventMask::from_bits(0b1000), None);
    }

    #[test]
    fn test_category_rotation_order() {
        assert!(Category::Read < Category::Write);
        assert!(Category::Write < Category::Error);
    }

    #[test]
    fn test_category_mask_bit() {
        assert_eq!(Category::Read.mask_bit(), Some(EventMask::READABLE));
        assert_eq!(Category::Write.mask_bit(), Some(EventMask::WRITABLE));
        assert_eq!(Category::Error.mask_bit(), Some(EventMask::ERRORED));
        assert_eq!(Category::Timer.mask_bit(), None);
    }

    #[test]
    fn test_event_token_fd() {
        assert_eq!(EventToken::Fd(7).fd(), Some(7));
        assert_eq!(EventToken::Timer.fd(), None);
    }
}
