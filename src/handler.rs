//! The handler callback contract.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::HandlerError;
use crate::reactor::Reactor;
use crate::types::EventContext;

/// Shared, internally-mutable reference to a handler.
///
/// The reactor stores clones of this in its descriptor table and timer
/// queue and drops them on unregistration (or, for timers, when the
/// entry is popped). Object lifetime therefore stays with whoever else
/// holds a clone; a handler owned only by a one-shot timer entry is
/// deallocated after it fires.
pub type HandlerRc = Rc<RefCell<dyn EventHandler>>;

/// Wrap a handler for registration.
pub fn handler_rc<H: EventHandler + 'static>(handler: H) -> HandlerRc {
    Rc::new(RefCell::new(handler))
}

/// A callback object invoked by the reactor when an event fires.
///
/// The reactor passes itself into the call, so a handler may re-enter
/// it during its own invocation: add or remove interest for any
/// descriptor (including ones other than the one that fired), schedule
/// or cancel timers, and change the idle policy. The dispatch path
/// clones the handler reference and re-reads its tables around the
/// call, so such mutation is safe; re-entering `dispatch_once` itself
/// from inside a handler is not.
///
/// An `Err` return abandons the current poll cycle and propagates out
/// of [`Reactor::run`]/[`Reactor::dispatch_once`] unchanged.
pub trait EventHandler {
    /// Handle one event. The context carries the descriptor (or timer
    /// sentinel), the category, and the poll-return timestamp.
    fn handle(&mut self, reactor: &mut Reactor, event: &EventContext)
        -> Result<(), HandlerError>;
}
