//! The reactor: descriptor interest table, timer schedule, idle
//! policy, and the single-event dispatch loop.
//!
//! One dispatch step drains due timers, polls readiness bounded by the
//! next deadline, and services exactly one ready (fd, category) slot
//! chosen by a persistent round-robin cursor. Dispatching a single
//! event per poll is deliberate: handling one event can invalidate the
//! readiness of others (closing a socket, swapping interest), so the
//! loop re-polls rather than act on stale state.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::ReactorError;
use crate::handler::HandlerRc;
use crate::poller::{self, ReadyFd};
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::{Category, EventContext, EventMask, EventToken};

/// Default capacity of the descriptor table.
const DEFAULT_FD_CAPACITY: usize = 1024;

/// Per-descriptor registration. At most one handler per category;
/// registering over an interested category silently replaces it.
#[derive(Default)]
struct FdRegistration {
    /// Indexed by [`Category::FD_CATEGORIES`] position.
    handlers: [Option<HandlerRc>; 3],
}

impl FdRegistration {
    fn get(&self, category: Category) -> Option<&HandlerRc> {
        Category::FD_CATEGORIES
            .iter()
            .position(|c| *c == category)
            .and_then(|idx| self.handlers[idx].as_ref())
    }

    fn set(&mut self, mask: EventMask, handler: &HandlerRc) {
        for (idx, category) in Category::FD_CATEGORIES.iter().enumerate() {
            if category.mask_bit().is_some_and(|bit| mask.contains(bit)) {
                self.handlers[idx] = Some(handler.clone());
            }
        }
    }

    fn clear(&mut self, mask: EventMask) {
        for (idx, category) in Category::FD_CATEGORIES.iter().enumerate() {
            if category.mask_bit().is_some_and(|bit| mask.contains(bit)) {
                self.handlers[idx] = None;
            }
        }
    }

    fn mask(&self) -> EventMask {
        let mut mask = EventMask::empty();
        for (idx, category) in Category::FD_CATEGORIES.iter().enumerate() {
            if self.handlers[idx].is_some() {
                if let Some(bit) = category.mask_bit() {
                    mask |= bit;
                }
            }
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.handlers.iter().all(Option::is_none)
    }
}

/// What bounds the readiness poll when no descriptor is ready.
enum IdlePolicy {
    /// Block until a descriptor or timer wakes the loop.
    WaitForever,
    /// Wake after `bound` and invoke the handler with a timer event.
    Bounded { bound: Duration, handler: HandlerRc },
}

/// Which bound produced the chosen poll timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
    Unbounded,
    Timer,
    Idle,
}

/// Builder for a [`Reactor`] with custom configuration.
///
/// # Example
///
/// ```ignore
/// let mut reactor = Reactor::builder().fd_capacity(4096).build();
/// ```
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    fd_capacity: usize,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            fd_capacity: DEFAULT_FD_CAPACITY,
        }
    }

    /// Maximum number of registered descriptors before `set_fd_mask`
    /// reports `TableFull`. Default: 1024.
    pub fn fd_capacity(mut self, capacity: usize) -> Self {
        self.fd_capacity = capacity;
        self
    }

    /// Build the reactor.
    pub fn build(self) -> Reactor {
        Reactor {
            table: BTreeMap::new(),
            fd_capacity: self.fd_capacity,
            timers: TimerQueue::new(),
            cursor: None,
            idle: IdlePolicy::WaitForever,
        }
    }
}

/// Single-threaded event dispatcher.
///
/// Owns the descriptor interest table, the timer queue, and the
/// round-robin fairness cursor. All state is per-instance, so
/// independent reactors coexist in one process; the type is `!Send`,
/// which makes the single-thread discipline a compile-time fact.
pub struct Reactor {
    /// Ordered so the cursor's (fd, category) rotation is deterministic.
    table: BTreeMap<RawFd, FdRegistration>,
    fd_capacity: usize,
    timers: TimerQueue,
    /// Last dispatched (fd, category) slot; rotation resumes after it.
    cursor: Option<(RawFd, Category)>,
    idle: IdlePolicy,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Create a reactor with default settings.
    pub fn new() -> Self {
        ReactorBuilder::new().build()
    }

    /// Create a builder for configuring the reactor.
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::new()
    }

    // === Registration operations ===

    /// Register `handler` for the categories in `mask` on `fd`.
    ///
    /// Categories not named in `mask` keep their current handler;
    /// categories already interested are silently replaced.
    pub fn set_fd_mask(
        &mut self,
        fd: RawFd,
        mask: EventMask,
        handler: HandlerRc,
    ) -> Result<(), ReactorError> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd);
        }
        if mask.is_empty() {
            return Err(ReactorError::InvalidMask);
        }
        if !self.table.contains_key(&fd) && self.table.len() >= self.fd_capacity {
            return Err(ReactorError::TableFull);
        }
        self.table.entry(fd).or_default().set(mask, &handler);
        trace!(fd, ?mask, "interest set");
        Ok(())
    }

    /// Drop the handlers for the categories in `mask` on `fd`.
    ///
    /// Partial clears of a multi-category registration are supported;
    /// clearing the last category removes the record entirely.
    pub fn clear_fd_mask(&mut self, fd: RawFd, mask: EventMask) -> Result<(), ReactorError> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd);
        }
        if mask.is_empty() {
            return Err(ReactorError::InvalidMask);
        }
        let reg = self
            .table
            .get_mut(&fd)
            .ok_or(ReactorError::NotRegistered)?;
        reg.clear(mask);
        if reg.is_empty() {
            self.table.remove(&fd);
        }
        trace!(fd, ?mask, "interest cleared");
        Ok(())
    }

    /// Schedule `handler` to fire at `deadline`. A deadline already in
    /// the past is legal and fires on the next dispatch step.
    pub fn set_timer(&mut self, deadline: Instant, handler: HandlerRc) -> TimerHandle {
        self.timers.insert(deadline, handler)
    }

    /// Schedule `handler` to fire `delta` from now.
    pub fn set_timer_relative(&mut self, delta: Duration, handler: HandlerRc) -> TimerHandle {
        self.timers.insert(Instant::now() + delta, handler)
    }

    /// Cancel a scheduled timer. Never blocks; a no-op if the timer
    /// already fired.
    pub fn cancel_timer(&mut self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Bound the readiness poll by `bound` and invoke `handler` with a
    /// timer event whenever the loop has been idle that long.
    pub fn set_idle_timeout(&mut self, bound: Duration, handler: HandlerRc) {
        self.idle = IdlePolicy::Bounded { bound, handler };
    }

    /// Remove the idle bound: with no timer pending, the poll blocks
    /// until a descriptor becomes ready.
    pub fn set_wait_forever(&mut self) {
        self.idle = IdlePolicy::WaitForever;
    }

    // === Introspection ===

    /// The currently registered interest on `fd`, if any.
    pub fn registered_mask(&self, fd: RawFd) -> Option<EventMask> {
        self.table.get(&fd).map(FdRegistration::mask)
    }

    /// Number of descriptors with at least one registered category.
    pub fn registration_count(&self) -> usize {
        self.table.len()
    }

    /// Number of timer entries occupying heap slots (cancelled entries
    /// included until they surface).
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    // === Dispatch loop ===

    /// Run dispatch steps until a handler or the poll signals failure.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        loop {
            self.dispatch_once()?;
        }
    }

    /// Perform one dispatch step: drain due timers, poll readiness
    /// bounded by the next deadline, and service at most one ready
    /// (fd, category) slot. Returns once something was dispatched: one
    /// or more timers, one fd event, or one idle callback.
    pub fn dispatch_once(&mut self) -> Result<(), ReactorError> {
        loop {
            if self.fire_due_timers()? > 0 {
                return Ok(());
            }

            let (timeout, wakeup) = self.next_timeout();
            let interests: Vec<(RawFd, EventMask)> = self
                .table
                .iter()
                .map(|(fd, reg)| (*fd, reg.mask()))
                .collect();

            let ready = match poller::poll(&interests, timeout) {
                Ok(ready) => ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "readiness poll failed");
                    return Err(ReactorError::Poll(e));
                }
            };
            let stamp = Instant::now();

            if ready.is_empty() {
                // Timed out. Timers may have become due while blocked.
                if self.fire_due_timers()? > 0 {
                    return Ok(());
                }
                if wakeup == Wakeup::Idle {
                    if let Some(handler) = self.idle_handler() {
                        let ctx = EventContext {
                            token: EventToken::Timer,
                            category: Category::Timer,
                            at: stamp,
                        };
                        handler.borrow_mut().handle(self, &ctx)?;
                        return Ok(());
                    }
                }
                continue;
            }

            match self.select_ready(&ready) {
                Some((fd, category, handler)) => {
                    self.cursor = Some((fd, category));
                    trace!(fd, ?category, "dispatching");
                    let ctx = EventContext {
                        token: EventToken::Fd(fd),
                        category,
                        at: stamp,
                    };
                    handler.borrow_mut().handle(self, &ctx)?;
                    return Ok(());
                }
                None => {
                    // Readiness with no matching registration points at a
                    // bug or an adversarial peer; abort this dispatch
                    // rather than crash.
                    warn!("readiness reported with no matching registration");
                    return Ok(());
                }
            }
        }
    }

    /// Fire every timer whose deadline has passed, oldest first. The
    /// clock is re-read after each fire: a fired timer may reschedule
    /// itself, and a stale reading risks re-firing it forever.
    fn fire_due_timers(&mut self) -> Result<usize, ReactorError> {
        let mut fired = 0;
        let mut now = Instant::now();
        while let Some((deadline, handler)) = self.timers.pop_due(now) {
            trace!(?deadline, "firing timer");
            let ctx = EventContext {
                token: EventToken::Timer,
                category: Category::Timer,
                at: now,
            };
            handler.borrow_mut().handle(self, &ctx)?;
            fired += 1;
            now = Instant::now();
        }
        Ok(fired)
    }

    fn idle_handler(&self) -> Option<HandlerRc> {
        match &self.idle {
            IdlePolicy::Bounded { handler, .. } => Some(handler.clone()),
            IdlePolicy::WaitForever => None,
        }
    }

    /// Poll timeout: the nearer of the idle bound and the earliest live
    /// timer deadline, or unbounded when neither applies.
    fn next_timeout(&mut self) -> (Option<Duration>, Wakeup) {
        let now = Instant::now();
        let until_timer = self
            .timers
            .peek_earliest()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (&self.idle, until_timer) {
            (IdlePolicy::WaitForever, None) => (None, Wakeup::Unbounded),
            (IdlePolicy::WaitForever, Some(t)) => (Some(t), Wakeup::Timer),
            (IdlePolicy::Bounded { bound, .. }, None) => (Some(*bound), Wakeup::Idle),
            (IdlePolicy::Bounded { bound, .. }, Some(t)) => {
                if t <= *bound {
                    (Some(t), Wakeup::Timer)
                } else {
                    (Some(*bound), Wakeup::Idle)
                }
            }
        }
    }

    /// Choose one ready (fd, category) slot by round-robin: the first
    /// candidate strictly after the cursor in (fd, category) order,
    /// wrapping to the smallest when none follows.
    fn select_ready(&self, ready: &[ReadyFd]) -> Option<(RawFd, Category, HandlerRc)> {
        let ready_by_fd: BTreeMap<RawFd, EventMask> =
            ready.iter().map(|r| (r.fd, r.ready)).collect();

        let mut candidates: Vec<(RawFd, Category)> = Vec::new();
        for (fd, reg) in &self.table {
            let Some(ready) = ready_by_fd.get(fd) else {
                continue;
            };
            let has_error = reg.get(Category::Error).is_some();
            let has_read = reg.get(Category::Read).is_some();
            for category in Category::FD_CATEGORIES {
                // An error condition with no error handler falls through
                // to the read (then write) handler so the owning
                // connection still observes the failure.
                let signalled = match category {
                    Category::Read => {
                        ready.contains(EventMask::READABLE)
                            || (ready.contains(EventMask::ERRORED) && !has_error)
                    }
                    Category::Write => {
                        ready.contains(EventMask::WRITABLE)
                            || (ready.contains(EventMask::ERRORED) && !has_error && !has_read)
                    }
                    Category::Error => ready.contains(EventMask::ERRORED),
                    Category::Timer => false,
                };
                if signalled && reg.get(category).is_some() {
                    candidates.push((*fd, category));
                }
            }
        }

        let chosen = match self.cursor {
            None => *candidates.first()?,
            Some(cursor) => candidates
                .iter()
                .copied()
                .find(|slot| *slot > cursor)
                .or_else(|| candidates.first().copied())?,
        };
        let handler = self.table.get(&chosen.0)?.get(chosen.1)?.clone();
        Some((chosen.0, chosen.1, handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::{handler_rc, EventHandler};

    struct NullHandler;

    impl EventHandler for NullHandler {
        fn handle(
            &mut self,
            _reactor: &mut Reactor,
            _event: &EventContext,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_defaults() {
        let reactor = Reactor::builder().build();
        assert_eq!(reactor.registration_count(), 0);
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_set_fd_mask_invalid_fd() {
        let mut reactor = Reactor::new();
        let result = reactor.set_fd_mask(-1, EventMask::READABLE, handler_rc(NullHandler));
        assert!(matches!(result, Err(ReactorError::InvalidFd)));
        assert_eq!(reactor.registration_count(), 0);
    }

    #[test]
    fn test_set_fd_mask_empty_mask() {
        let mut reactor = Reactor::new();
        let result = reactor.set_fd_mask(3, EventMask::empty(), handler_rc(NullHandler));
        assert!(matches!(result, Err(ReactorError::InvalidMask)));
    }

    #[test]
    fn test_set_fd_mask_table_full() {
        let mut reactor = Reactor::builder().fd_capacity(1).build();
        reactor
            .set_fd_mask(3, EventMask::READABLE, handler_rc(NullHandler))
            .unwrap();
        let result = reactor.set_fd_mask(4, EventMask::READABLE, handler_rc(NullHandler));
        assert!(matches!(result, Err(ReactorError::TableFull)));
        // Updating an already-registered fd is not bounded by capacity.
        reactor
            .set_fd_mask(3, EventMask::WRITABLE, handler_rc(NullHandler))
            .unwrap();
        assert_eq!(
            reactor.registered_mask(3),
            Some(EventMask::READABLE | EventMask::WRITABLE)
        );
    }

    #[test]
    fn test_partial_clear_preserves_other_categories() {
        let mut reactor = Reactor::new();
        reactor
            .set_fd_mask(
                5,
                EventMask::READABLE | EventMask::WRITABLE,
                handler_rc(NullHandler),
            )
            .unwrap();
        reactor.clear_fd_mask(5, EventMask::READABLE).unwrap();
        assert_eq!(reactor.registered_mask(5), Some(EventMask::WRITABLE));
        reactor.clear_fd_mask(5, EventMask::WRITABLE).unwrap();
        assert_eq!(reactor.registered_mask(5), None);
        assert_eq!(reactor.registration_count(), 0);
    }

    #[test]
    fn test_clear_unregistered_fd() {
        let mut reactor = Reactor::new();
        let result = reactor.clear_fd_mask(9, EventMask::READABLE);
        assert!(matches!(result, Err(ReactorError::NotRegistered)));
    }

    #[test]
    fn test_clear_twice_reports_not_registered() {
        let mut reactor = Reactor::new();
        reactor
            .set_fd_mask(5, EventMask::READABLE, handler_rc(NullHandler))
            .unwrap();
        reactor.clear_fd_mask(5, EventMask::READABLE).unwrap();
        // Second clear is a no-op beyond the error report.
        let result = reactor.clear_fd_mask(5, EventMask::READABLE);
        assert!(matches!(result, Err(ReactorError::NotRegistered)));
        assert_eq!(reactor.registration_count(), 0);
    }

    #[test]
    fn test_register_replaces_silently() {
        let mut reactor = Reactor::new();
        let first = handler_rc(NullHandler);
        let second = handler_rc(NullHandler);
        reactor
            .set_fd_mask(5, EventMask::READABLE, first)
            .unwrap();
        reactor
            .set_fd_mask(5, EventMask::READABLE, second.clone())
            .unwrap();
        let reg = reactor.table.get(&5).unwrap();
        let held = reg.get(Category::Read).unwrap();
        assert!(std::rc::Rc::ptr_eq(held, &second));
    }

    #[test]
    fn test_timer_registration_introspection() {
        let mut reactor = Reactor::new();
        let handle = reactor.set_timer_relative(Duration::from_secs(60), handler_rc(NullHandler));
        assert_eq!(reactor.pending_timers(), 1);
        reactor.cancel_timer(&handle);
        assert!(!handle.is_scheduled());
    }
}
