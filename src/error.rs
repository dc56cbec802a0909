//! Error types for the reactor and the protocol handlers.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors returned by the reactor.
///
/// Argument errors (`InvalidFd`, `InvalidMask`, `TableFull`,
/// `NotRegistered`) are rejected synchronously and leave no state
/// change behind. `Poll` is fatal to the dispatch loop: without a
/// usable readiness poll the reactor cannot continue. `Handler` carries
/// a failure signalled by a handler, propagated unchanged.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The file descriptor is outside the representable range.
    #[error("file descriptor out of range")]
    InvalidFd,
    /// The interest mask is empty or carries unrecognized bits.
    #[error("invalid interest mask")]
    InvalidMask,
    /// The registration table reached its configured capacity.
    #[error("descriptor table full")]
    TableFull,
    /// The descriptor has no current registration.
    #[error("descriptor not registered")]
    NotRegistered,
    /// The readiness poll itself failed.
    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),
    /// A handler signalled failure; forwarded to the loop's caller.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// Failure signalled by a handler.
///
/// Returning this from [`EventHandler::handle`](crate::EventHandler::handle)
/// is a directive to the caller of the dispatch loop, not a local
/// recoverable condition: the reactor abandons the current poll cycle
/// and propagates it without retrying.
#[derive(Debug)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    /// Wrap any error as a handler failure.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError(source.into())
    }

    /// Take back the wrapped error.
    pub fn into_inner(self) -> Box<dyn std::error::Error + Send + Sync> {
        self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        HandlerError(Box::new(e))
    }
}

/// Errors returned by the TCP and UDP protocol handlers.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The endpoint is already listening, connecting or connected.
    #[error("endpoint already open")]
    AlreadyOpen,
    /// The operation needs an established connection.
    #[error("not connected")]
    NotConnected,
    /// A socket call (bind, listen, connect, read, write) failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Registering with the reactor failed.
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    /// The sink signalled failure during a synchronous delivery.
    #[error("sink failed: {0}")]
    Sink(#[from] HandlerError),
}
