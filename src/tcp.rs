//! TCP connection state machine: one connection per handler.
//!
//! Supports passive open (listen, accept one peer, swap interest from
//! the listening socket to the data socket) and active open
//! (non-blocking connect with write buffering until the handshake
//! completes). Application-level events are delivered to a
//! [`ConnectionSink`].

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{HandlerError, SocketError};
use crate::handler::{EventHandler, HandlerRc};
use crate::reactor::Reactor;
use crate::types::{Category, EventContext, EventMask, EventToken};

/// Bytes read from a socket per readiness event.
pub(crate) const RECV_CHUNK: usize = 16 * 1024;

/// Shared reference to a connection sink.
pub type SinkRc = Rc<RefCell<dyn ConnectionSink>>;

/// Application-level connection event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventKind {
    /// The connection is established (accepted or connected).
    Open,
    /// Bytes were appended to the accumulation buffer.
    Data,
    /// The peer closed, or the connection was torn down on error.
    Close,
    /// An outbound connect was initiated and is in progress.
    Calling,
}

/// Outcome of an active open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// The connect completed immediately.
    Established,
    /// The handshake is in flight; `Open` (or `Close` on failure) will
    /// be delivered from the dispatch loop.
    InProgress,
}

/// One connection event as seen by the application.
pub struct SocketEvent<'a> {
    /// What happened.
    pub kind: SocketEventKind,
    /// The remote peer, when known.
    pub peer: Option<SocketAddr>,
    /// The read accumulation buffer. The sink consumes what it needs
    /// (`split_to`, `advance`); unconsumed bytes stay for the next
    /// `Data` event.
    pub buffer: &'a mut BytesMut,
}

/// Application callback for connection lifecycle events.
///
/// Invoked from inside the reactor's dispatch, so the connection object
/// itself is mutably borrowed for the duration of the call; all
/// interaction goes through the [`ConnectionCtx`] rather than the
/// connection handle.
pub trait ConnectionSink {
    /// Handle one connection event.
    fn on_event(
        &mut self,
        conn: &mut ConnectionCtx<'_>,
        event: SocketEvent<'_>,
    ) -> Result<(), HandlerError>;
}

/// Write-side access handed to a [`ConnectionSink`] during delivery.
pub struct ConnectionCtx<'a> {
    stream: Option<&'a TcpStream>,
    pending: &'a mut BytesMut,
    peer: Option<SocketAddr>,
    open: bool,
    want_write: &'a mut bool,
    close_after: &'a mut bool,
}

impl<'a> ConnectionCtx<'a> {
    pub(crate) fn new(
        stream: Option<&'a TcpStream>,
        pending: &'a mut BytesMut,
        peer: Option<SocketAddr>,
        open: bool,
        want_write: &'a mut bool,
        close_after: &'a mut bool,
    ) -> Self {
        ConnectionCtx {
            stream,
            pending,
            peer,
            open,
            want_write,
            close_after,
        }
    }

    /// Write bytes to the connection: sent directly when open, queued
    /// (order-preserving) otherwise. Returns the number of bytes
    /// written or queued; a hard write failure requests teardown and
    /// returns 0.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let stream = match (self.open, self.stream) {
            (true, Some(stream)) => stream,
            _ => {
                self.pending.extend_from_slice(data);
                return data.len();
            }
        };
        match write_or_queue(stream, self.pending, data) {
            Ok(queued) => {
                if queued {
                    *self.want_write = true;
                }
                data.len()
            }
            Err(e) => {
                debug!(error = %e, "write failed");
                *self.close_after = true;
                0
            }
        }
    }

    /// The remote peer, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Request teardown of this connection once the callback returns.
    pub fn close(&mut self) {
        *self.close_after = true;
    }
}

/// Write as much of `data` as the socket accepts, queueing the rest.
/// Returns whether anything was queued (write interest is then needed).
/// Bytes already queued always go first so ordering is preserved.
pub(crate) fn write_or_queue(
    mut stream: &TcpStream,
    pending: &mut BytesMut,
    data: &[u8],
) -> io::Result<bool> {
    if !pending.is_empty() {
        pending.extend_from_slice(data);
        return Ok(true);
    }
    let mut off = 0;
    while off < data.len() {
        match stream.write(&data[off..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                pending.extend_from_slice(&data[off..]);
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Drain the pending buffer into the socket. Returns whether the buffer
/// was fully drained.
pub(crate) fn flush_pending(mut stream: &TcpStream, pending: &mut BytesMut) -> io::Result<bool> {
    while !pending.is_empty() {
        match stream.write(pending.as_ref()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => pending.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

pub(crate) fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Bind a non-blocking listening socket.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

/// Whether a connect error means "in progress" on this platform.
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No sockets open.
    Closed,
    /// Passive: waiting for one incoming connection.
    Listening,
    /// Active: non-blocking connect in flight.
    Connecting,
    /// Data phase.
    Open,
}

/// A single TCP connection driven by the reactor.
///
/// In passive mode exactly one of the listening socket and the data
/// socket holds read interest at a time; active mode has no listening
/// socket at all. Writes issued while a connect is in progress are
/// queued and flushed, in order, the moment the connect completes.
pub struct TcpConnection {
    weak: Weak<RefCell<TcpConnection>>,
    sink: SinkRc,
    state: TcpState,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    rx: BytesMut,
    pending: BytesMut,
    active: bool,
}

impl TcpConnection {
    /// Create a connection delivering events to `sink`.
    pub fn new(sink: SinkRc) -> Rc<RefCell<TcpConnection>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(TcpConnection {
                weak: weak.clone(),
                sink,
                state: TcpState::Closed,
                listener: None,
                stream: None,
                peer: None,
                rx: BytesMut::new(),
                pending: BytesMut::new(),
                active: false,
            })
        })
    }

    fn as_handler(&self) -> HandlerRc {
        self.weak
            .upgrade()
            .expect("connection invoked after its Rc was dropped")
    }

    /// Bind and listen; the first incoming connection becomes the data
    /// socket and `Open` is delivered.
    pub fn open_passive(
        &mut self,
        reactor: &mut Reactor,
        addr: SocketAddr,
        backlog: u32,
    ) -> Result<(), SocketError> {
        if self.state != TcpState::Closed {
            return Err(SocketError::AlreadyOpen);
        }
        let listener = bind_listener(addr, backlog)?;
        reactor.set_fd_mask(listener.as_raw_fd(), EventMask::READABLE, self.as_handler())?;
        self.listener = Some(listener);
        self.active = false;
        self.state = TcpState::Listening;
        Ok(())
    }

    /// Start a non-blocking connect to `remote`, optionally binding
    /// `local` first. On `Established` the connection is open and
    /// `Open` has been delivered; on `InProgress` write-interest is
    /// armed and completion is detected from the dispatch loop.
    pub fn open_active(
        &mut self,
        reactor: &mut Reactor,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<ConnectState, SocketError> {
        if self.state != TcpState::Closed {
            return Err(SocketError::AlreadyOpen);
        }
        let socket = Socket::new(domain_for(&remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if let Some(local) = local {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        let progress = match socket.connect(&remote.into()) {
            Ok(()) => ConnectState::Established,
            Err(e) if connect_in_progress(&e) => ConnectState::InProgress,
            Err(e) => return Err(SocketError::Io(e)),
        };
        let stream: TcpStream = socket.into();
        let fd = stream.as_raw_fd();
        match progress {
            ConnectState::Established => {
                reactor.set_fd_mask(fd, EventMask::READABLE, self.as_handler())?;
                self.stream = Some(stream);
                self.peer = Some(remote);
                self.active = true;
                self.state = TcpState::Open;
                self.deliver(reactor, SocketEventKind::Open)?;
            }
            ConnectState::InProgress => {
                // Write-readiness on a connecting socket signals that the
                // handshake finished, one way or the other.
                reactor.set_fd_mask(fd, EventMask::WRITABLE, self.as_handler())?;
                self.stream = Some(stream);
                self.peer = Some(remote);
                self.active = true;
                self.state = TcpState::Connecting;
                self.deliver(reactor, SocketEventKind::Calling)?;
            }
        }
        Ok(progress)
    }

    /// Write bytes: sent directly when open, queued while a connect is
    /// in progress. Returns the number of bytes written or queued.
    pub fn write(&mut self, reactor: &mut Reactor, data: &[u8]) -> Result<usize, SocketError> {
        match self.state {
            TcpState::Closed | TcpState::Listening => Err(SocketError::NotConnected),
            TcpState::Connecting => {
                self.pending.extend_from_slice(data);
                Ok(data.len())
            }
            TcpState::Open => {
                let outcome = match self.stream.as_ref() {
                    Some(stream) => write_or_queue(stream, &mut self.pending, data),
                    None => return Err(SocketError::NotConnected),
                };
                match outcome {
                    Ok(queued) => {
                        if queued {
                            self.arm_write(reactor);
                        }
                        Ok(data.len())
                    }
                    Err(e) => {
                        self.teardown(reactor);
                        Err(SocketError::Io(e))
                    }
                }
            }
        }
    }

    /// Tear everything down: unregister and drop both sockets.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(listener) = self.listener.take() {
            let fd = listener.as_raw_fd();
            if reactor.registered_mask(fd).is_some() {
                let _ = reactor.clear_fd_mask(fd, EventMask::all());
            }
        }
        self.teardown(reactor);
        self.rx.clear();
        self.peer = None;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Whether the data phase is reached.
    pub fn is_open(&self) -> bool {
        self.state == TcpState::Open
    }

    /// Whether this endpoint initiated the connection.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The remote peer, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local address of the data socket, or of the listening socket
    /// while waiting for a peer.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(stream) = &self.stream {
            return stream.local_addr().ok();
        }
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bytes currently queued behind the socket (connect in progress or
    /// short writes).
    pub fn queued_bytes(&self) -> usize {
        self.pending.len()
    }

    fn arm_write(&mut self, reactor: &mut Reactor) {
        if let Some(stream) = &self.stream {
            let fd = stream.as_raw_fd();
            let handler = self.as_handler();
            if let Err(e) = reactor.set_fd_mask(fd, EventMask::WRITABLE, handler) {
                warn!(fd, error = %e, "arming write interest failed");
            }
        }
    }

    fn accept_ready(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
        if self.state == TcpState::Open {
            // Interest is swapped off the listener at accept; getting
            // here means the table disagrees with the state machine.
            warn!("incoming connection while one is already open");
            return Ok(());
        }
        let Some(listener) = &self.listener else {
            warn!("accept event without a listening socket");
            return Ok(());
        };
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                debug!(error = %e, "accept failed");
                return Ok(());
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            debug!(error = %e, "accepted socket setup failed");
            return Ok(());
        }
        let listener_fd = listener.as_raw_fd();
        if let Err(e) = reactor.clear_fd_mask(listener_fd, EventMask::READABLE) {
            warn!(fd = listener_fd, error = %e, "swapping listener interest failed");
        }
        let handler = self.as_handler();
        if let Err(e) = reactor.set_fd_mask(stream.as_raw_fd(), EventMask::READABLE, handler) {
            warn!(error = %e, "registering accepted socket failed");
            return Ok(());
        }
        self.peer = Some(peer);
        self.stream = Some(stream);
        self.state = TcpState::Open;
        self.deliver(reactor, SocketEventKind::Open)
    }

    fn connect_ready(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
        let (fd, probe) = match self.stream.as_ref() {
            Some(stream) => (stream.as_raw_fd(), stream.take_error()),
            None => {
                warn!("connect event without a socket");
                return Ok(());
            }
        };
        match probe {
            Ok(None) => {
                let drained = {
                    let stream = match self.stream.as_ref() {
                        Some(stream) => stream,
                        None => return Ok(()),
                    };
                    flush_pending(stream, &mut self.pending)
                };
                match drained {
                    Ok(drained) => {
                        if drained {
                            if let Err(e) = reactor.clear_fd_mask(fd, EventMask::WRITABLE) {
                                warn!(fd, error = %e, "clearing write interest failed");
                            }
                        }
                        if let Err(e) =
                            reactor.set_fd_mask(fd, EventMask::READABLE, self.as_handler())
                        {
                            warn!(fd, error = %e, "registering read interest failed");
                        }
                        self.state = TcpState::Open;
                        self.deliver(reactor, SocketEventKind::Open)
                    }
                    Err(e) => {
                        debug!(error = %e, "flush after connect failed");
                        self.close_and_notify(reactor)
                    }
                }
            }
            Ok(Some(e)) => {
                debug!(error = %e, "connect failed");
                self.close_and_notify(reactor)
            }
            Err(e) => {
                debug!(error = %e, "connect probe failed");
                self.close_and_notify(reactor)
            }
        }
    }

    fn read_ready(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
        let mut chunk = [0u8; RECV_CHUNK];
        let outcome = match self.stream.as_ref() {
            Some(mut stream) => stream.read(&mut chunk),
            None => {
                warn!("read event without a socket");
                return Ok(());
            }
        };
        match outcome {
            Ok(0) => self.close_and_notify(reactor),
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                self.deliver(reactor, SocketEventKind::Data)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                debug!(error = %e, "read failed");
                self.close_and_notify(reactor)
            }
        }
    }

    fn write_ready(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
        let outcome = match self.stream.as_ref() {
            Some(stream) => {
                let fd = stream.as_raw_fd();
                flush_pending(stream, &mut self.pending).map(|drained| (fd, drained))
            }
            None => {
                warn!("write event without a socket");
                return Ok(());
            }
        };
        match outcome {
            Ok((fd, true)) => {
                if let Err(e) = reactor.clear_fd_mask(fd, EventMask::WRITABLE) {
                    warn!(fd, error = %e, "clearing write interest failed");
                }
                Ok(())
            }
            Ok((_, false)) => Ok(()),
            Err(e) => {
                debug!(error = %e, "flush failed");
                self.close_and_notify(reactor)
            }
        }
    }

    /// Per-connection failure or peer close: tear down this connection
    /// only and tell the sink.
    fn close_and_notify(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
        self.teardown(reactor);
        self.deliver(reactor, SocketEventKind::Close)
    }

    fn teardown(&mut self, reactor: &mut Reactor) {
        if let Some(stream) = self.stream.take() {
            let fd = stream.as_raw_fd();
            if reactor.registered_mask(fd).is_some() {
                let _ = reactor.clear_fd_mask(fd, EventMask::all());
            }
        }
        self.pending.clear();
        self.state = TcpState::Closed;
    }

    /// Invoke the sink with disjoint borrows of the connection's parts,
    /// then apply whatever the callback requested.
    fn deliver(&mut self, reactor: &mut Reactor, kind: SocketEventKind) -> Result<(), HandlerError> {
        let sink = self.sink.clone();
        let mut want_write = false;
        let mut close_after = false;
        {
            let mut ctx = ConnectionCtx {
                stream: self.stream.as_ref(),
                pending: &mut self.pending,
                peer: self.peer,
                open: self.state == TcpState::Open,
                want_write: &mut want_write,
                close_after: &mut close_after,
            };
            let event = SocketEvent {
                kind,
                peer: self.peer,
                buffer: &mut self.rx,
            };
            sink.borrow_mut().on_event(&mut ctx, event)?;
        }
        if want_write && self.state == TcpState::Open {
            self.arm_write(reactor);
        }
        if close_after {
            self.teardown(reactor);
        }
        Ok(())
    }
}

impl EventHandler for TcpConnection {
    fn handle(
        &mut self,
        reactor: &mut Reactor,
        event: &EventContext,
    ) -> Result<(), HandlerError> {
        let fd = match event.token {
            EventToken::Fd(fd) => fd,
            EventToken::Timer => {
                warn!("timer event delivered to a TCP connection");
                return Ok(());
            }
        };
        let listener_fd = self.listener.as_ref().map(|l| l.as_raw_fd());
        let stream_fd = self.stream.as_ref().map(|s| s.as_raw_fd());
        match event.category {
            Category::Read if Some(fd) == listener_fd => self.accept_ready(reactor),
            Category::Read if Some(fd) == stream_fd => self.read_ready(reactor),
            Category::Write if Some(fd) == stream_fd && self.state == TcpState::Connecting => {
                self.connect_ready(reactor)
            }
            Category::Write if Some(fd) == stream_fd => self.write_ready(reactor),
            Category::Error if Some(fd) == stream_fd => {
                debug!(fd, "error condition on connection");
                self.close_and_notify(reactor)
            }
            _ => {
                warn!(fd, category = ?event.category, "event for unexpected descriptor");
                Ok(())
            }
        }
    }
}
