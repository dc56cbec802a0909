//! event-driver - single-threaded readiness reactor with timers.
//!
//! A [`Reactor`] multiplexes readiness events on a set of file
//! descriptors together with a schedule of absolute-time timer
//! callbacks, and invokes user-supplied [`EventHandler`] objects when
//! an event fires. Layered on top are connection-oriented protocol
//! handlers: [`TcpConnection`] (single connection, passive or active
//! open), [`TcpServer`] (many connections behind one listener), and
//! [`UdpPort`] (per-source datagram fan-out).
//!
//! # Features
//!
//! - **Level-triggered**: one readiness poll per loop iteration, one
//!   event dispatched per poll
//! - **Fair**: a persistent round-robin cursor rotates service across
//!   ready descriptors, so a busy one cannot starve the rest
//! - **Timers**: absolute deadlines in a min-heap with O(1) lazy
//!   cancellation
//! - **Cooperative**: handlers run to completion on the calling thread;
//!   no locking, no thread pool
//!
//! # Quick Start
//!
//! ```ignore
//! use event_driver::{Reactor, TcpServer, ConnectionSink};
//!
//! let mut reactor = Reactor::new();
//! let server = TcpServer::new(my_sink);
//! server.borrow_mut().open(&mut reactor, "0.0.0.0:8080".parse()?, 128)?;
//!
//! // Dispatch until a handler or the poll signals failure.
//! reactor.run()?;
//! ```
//!
//! # Dispatch model
//!
//! Each [`Reactor::dispatch_once`] step fires every timer already due
//! (oldest first), polls readiness bounded by the next deadline or the
//! idle timeout, and services exactly one ready (fd, category) slot.
//! Handling one event can invalidate the readiness of others, so the
//! loop re-polls after every dispatch instead of acting on stale state.

mod error;
mod handler;
mod poller;
mod reactor;
mod tcp;
mod tcp_server;
mod timer;
mod types;
mod udp;

// Re-exports
pub use error::{HandlerError, ReactorError, SocketError};
pub use handler::{handler_rc, EventHandler, HandlerRc};
pub use reactor::{Reactor, ReactorBuilder};
pub use tcp::{
    ConnectState, ConnectionCtx, ConnectionSink, SinkRc, SocketEvent, SocketEventKind,
    TcpConnection, TcpState,
};
pub use tcp_server::TcpServer;
pub use timer::{TimerHandle, TimerQueue};
pub use types::{Category, EventContext, EventMask, EventToken};
pub use udp::{Datagram, DatagramSink, DatagramSinkRc, DatagramVerdict, UdpPort, UdpResponder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_default() {
        let reactor = Reactor::default();
        assert_eq!(reactor.registration_count(), 0);
    }

    #[test]
    fn test_reactor_is_not_send() {
        // Compile-time property: Rc-based handler storage keeps the
        // reactor on one thread. This is a documentation anchor; the
        // real check is that `fn assert_send<T: Send>()` would not
        // accept `Reactor`.
        let reactor = Reactor::new();
        drop(reactor);
    }
}
