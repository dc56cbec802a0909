//! Min-heap timer queue with lazy cancellation.
//!
//! Entries are ordered by absolute deadline (insertion order breaks
//! ties). Cancellation marks the entry in place and never disturbs the
//! heap: a cancelled entry keeps its slot until it surfaces at the top
//! and is discarded. This keeps `cancel` O(1) at the cost of dead
//! entries lingering, which is the right trade when cancellation is
//! rare relative to firing.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::handler::HandlerRc;

/// Scheduled-or-cancelled payload of one timer entry.
enum TimerState {
    Scheduled(HandlerRc),
    Cancelled,
}

/// One heap entry. The state cell is shared with the [`TimerHandle`]
/// returned at insertion, which is how cancellation reaches an entry
/// buried in the heap without a lookup.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    state: Rc<RefCell<TimerState>>,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behaviour; seq keeps equal deadlines FIFO.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Opaque, cheaply clonable handle to one scheduled timer.
///
/// `cancel` is advisory and total: it never blocks, guarantees the
/// handler will not be invoked if the entry has not fired yet, and is a
/// no-op on an entry that already fired (the handle holds only a weak
/// reference, so it does not keep anything alive).
#[derive(Clone)]
pub struct TimerHandle {
    state: Weak<RefCell<TimerState>>,
}

impl TimerHandle {
    /// Mark the timer cancelled in place.
    pub fn cancel(&self) {
        if let Some(state) = self.state.upgrade() {
            *state.borrow_mut() = TimerState::Cancelled;
        }
    }

    /// Whether the entry is still scheduled (not cancelled, not fired).
    pub fn is_scheduled(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => matches!(*state.borrow(), TimerState::Scheduled(_)),
            None => false,
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Min-heap of timer entries ordered by absolute fire time.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a handler for `deadline`. Always succeeds; a deadline
    /// already in the past is legal and fires on the next drain.
    pub fn insert(&mut self, deadline: Instant, handler: HandlerRc) -> TimerHandle {
        let state = Rc::new(RefCell::new(TimerState::Scheduled(handler)));
        let handle = TimerHandle {
            state: Rc::downgrade(&state),
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(TimerEntry {
            deadline,
            seq,
            state,
        });
        handle
    }

    /// Deadline of the earliest live entry. Cancelled entries that have
    /// surfaced at the top are discarded on the way.
    pub fn peek_earliest(&mut self) -> Option<Instant> {
        loop {
            let head = self.heap.peek()?;
            if matches!(*head.state.borrow(), TimerState::Cancelled) {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
    }

    /// Remove and return the earliest live entry. Cancelled entries are
    /// destroyed as they surface.
    pub fn pop_earliest(&mut self) -> Option<(Instant, HandlerRc)> {
        loop {
            let entry = self.heap.pop()?;
            let state = mem::replace(&mut *entry.state.borrow_mut(), TimerState::Cancelled);
            if let TimerState::Scheduled(handler) = state {
                return Some((entry.deadline, handler));
            }
        }
    }

    /// Like [`pop_earliest`](Self::pop_earliest), but only if the
    /// earliest live deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, HandlerRc)> {
        if self.peek_earliest()? > now {
            return None;
        }
        self.pop_earliest()
    }

    /// Number of entries occupying heap slots, cancelled ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the heap holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::handler_rc;
    use crate::reactor::Reactor;
    use crate::types::EventContext;
    use std::time::Duration;

    struct NullHandler;

    impl crate::handler::EventHandler for NullHandler {
        fn handle(
            &mut self,
            _reactor: &mut Reactor,
            _event: &EventContext,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.insert(now + Duration::from_millis(30), handler_rc(NullHandler));
        queue.insert(now + Duration::from_millis(10), handler_rc(NullHandler));
        queue.insert(now + Duration::from_millis(20), handler_rc(NullHandler));

        let a = queue.pop_earliest().unwrap().0;
        let b = queue.pop_earliest().unwrap().0;
        let c = queue.pop_earliest().unwrap().0;
        assert!(a <= b && b <= c);
        assert_eq!(a, now + Duration::from_millis(10));
        assert!(queue.pop_earliest().is_none());
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let mut queue = TimerQueue::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        let first = handler_rc(NullHandler);
        let second = handler_rc(NullHandler);
        queue.insert(deadline, first.clone());
        queue.insert(deadline, second.clone());

        let (_, popped) = queue.pop_earliest().unwrap();
        assert!(Rc::ptr_eq(&popped, &first));
        let (_, popped) = queue.pop_earliest().unwrap();
        assert!(Rc::ptr_eq(&popped, &second));
    }

    #[test]
    fn test_past_deadline_is_due() {
        let mut queue = TimerQueue::new();
        let past = Instant::now() - Duration::from_millis(50);
        queue.insert(past, handler_rc(NullHandler));
        assert!(queue.pop_due(Instant::now()).is_some());
    }

    #[test]
    fn test_cancel_marks_in_place() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let handle = queue.insert(now, handler_rc(NullHandler));
        queue.insert(now + Duration::from_millis(1), handler_rc(NullHandler));

        assert!(handle.is_scheduled());
        handle.cancel();
        assert!(!handle.is_scheduled());
        // The cancelled entry still occupies its heap slot.
        assert_eq!(queue.len(), 2);

        // The cancelled head is discarded; the live entry survives.
        let (deadline, _) = queue.pop_earliest().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut queue = TimerQueue::new();
        let handle = queue.insert(Instant::now(), handler_rc(NullHandler));
        assert!(queue.pop_earliest().is_some());
        handle.cancel();
        assert!(!handle.is_scheduled());
    }

    #[test]
    fn test_peek_skips_cancelled_heads() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let early = queue.insert(now, handler_rc(NullHandler));
        queue.insert(now + Duration::from_millis(10), handler_rc(NullHandler));
        early.cancel();
        assert_eq!(queue.peek_earliest(), Some(now + Duration::from_millis(10)));
        // peek destroyed the cancelled head.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_due_respects_now() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.insert(now + Duration::from_secs(60), handler_rc(NullHandler));
        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_one_shot_handler_released_on_pop() {
        let mut queue = TimerQueue::new();
        let handler = handler_rc(NullHandler);
        queue.insert(Instant::now(), handler.clone());
        let weak = Rc::downgrade(&handler);
        drop(handler);
        // The queue holds the only strong reference now.
        assert!(weak.upgrade().is_some());
        drop(queue.pop_earliest());
        assert!(weak.upgrade().is_none());
    }
}
