//! TCP connection state machine: many connections behind one listener.
//!
//! Accept logic matches the single-connection variant, but the
//! listening socket keeps its read interest forever and every accepted
//! connection gets an independent entry, looked up by descriptor or by
//! peer address. Closing one connection removes only its entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use slab::Slab;
use tracing::{debug, warn};

use crate::error::{HandlerError, SocketError};
use crate::handler::{EventHandler, HandlerRc};
use crate::reactor::Reactor;
use crate::tcp::{
    bind_listener, flush_pending, write_or_queue, ConnectionCtx, SinkRc, SocketEvent,
    SocketEventKind, RECV_CHUNK,
};
use crate::types::{Category, EventContext, EventMask, EventToken};

/// One accepted connection.
struct ConnectionEntry {
    stream: TcpStream,
    peer: SocketAddr,
    rx: BytesMut,
    pending: BytesMut,
}

/// A listening endpoint serving many concurrent connections.
///
/// All sockets (the listener and every data socket) dispatch to the
/// same handler; events are routed to the right entry by descriptor.
pub struct TcpServer {
    weak: Weak<RefCell<TcpServer>>,
    sink: SinkRc,
    listener: Option<TcpListener>,
    entries: Slab<ConnectionEntry>,
    by_fd: HashMap<RawFd, usize>,
    by_peer: HashMap<SocketAddr, usize>,
}

impl TcpServer {
    /// Create a server delivering events to `sink`.
    pub fn new(sink: SinkRc) -> Rc<RefCell<TcpServer>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(TcpServer {
                weak: weak.clone(),
                sink,
                listener: None,
                entries: Slab::new(),
                by_fd: HashMap::new(),
                by_peer: HashMap::new(),
            })
        })
    }

    fn as_handler(&self) -> HandlerRc {
        self.weak
            .upgrade()
            .expect("server invoked after its Rc was dropped")
    }

    /// Bind and listen. New connections may arrive for as long as the
    /// server stays open.
    pub fn open(
        &mut self,
        reactor: &mut Reactor,
        addr: SocketAddr,
        backlog: u32,
    ) -> Result<(), SocketError> {
        if self.listener.is_some() {
            return Err(SocketError::AlreadyOpen);
        }
        let listener = bind_listener(addr, backlog)?;
        reactor.set_fd_mask(listener.as_raw_fd(), EventMask::READABLE, self.as_handler())?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Local address of the listening socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of live accepted connections.
    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `peer` currently has a live connection.
    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.by_peer.contains_key(&peer)
    }

    /// Write bytes to the connection from `peer`: sent directly, queued
    /// behind write interest on a short write.
    pub fn write_to(
        &mut self,
        reactor: &mut Reactor,
        peer: SocketAddr,
        data: &[u8],
    ) -> Result<usize, SocketError> {
        let slot = *self
            .by_peer
            .get(&peer)
            .ok_or(SocketError::NotConnected)?;
        let outcome = match self.entries.get_mut(slot) {
            Some(entry) => write_or_queue(&entry.stream, &mut entry.pending, data),
            None => return Err(SocketError::NotConnected),
        };
        match outcome {
            Ok(queued) => {
                if queued {
                    self.arm_entry_write(reactor, slot);
                }
                Ok(data.len())
            }
            Err(e) => {
                debug!(%peer, error = %e, "write failed");
                self.drop_entry(reactor, slot, true)
                    .map_err(SocketError::Sink)?;
                Err(SocketError::Io(e))
            }
        }
    }

    /// Close the connection from `peer`, if any, without notifying the
    /// sink. Returns whether an entry was removed.
    pub fn close_connection(&mut self, reactor: &mut Reactor, peer: SocketAddr) -> bool {
        match self.by_peer.get(&peer).copied() {
            Some(slot) => {
                // Sink is not told about a close it asked for.
                let _ = self.drop_entry(reactor, slot, false);
                true
            }
            None => false,
        }
    }

    /// Stop listening and drop every connection, silently.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(listener) = self.listener.take() {
            let fd = listener.as_raw_fd();
            if reactor.registered_mask(fd).is_some() {
                let _ = reactor.clear_fd_mask(fd, EventMask::all());
            }
        }
        let slots: Vec<usize> = self.entries.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let _ = self.drop_entry(reactor, slot, false);
        }
    }

    fn arm_entry_write(&mut self, reactor: &mut Reactor, slot: usize) {
        let Some(entry) = self.entries.get(slot) else {
            return;
        };
        let fd = entry.stream.as_raw_fd();
        let handler = self.as_handler();
        if let Err(e) = reactor.set_fd_mask(fd, EventMask::WRITABLE, handler) {
            warn!(fd, error = %e, "arming write interest failed");
        }
    }

    fn accept_ready(&mut self, reactor: &mut Reactor) -> Result<(), HandlerError> {
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
        let fd = stream.as_raw_fd();
        let handler = self.as_handler();
        if let Err(e) = reactor.set_fd_mask(fd, EventMask::READABLE, handler) {
            // Table full or the like: refuse this connection, keep serving.
            warn!(%peer, error = %e, "registering accepted socket failed");
            return Ok(());
        }
        let slot = self.entries.insert(ConnectionEntry {
            stream,
            peer,
            rx: BytesMut::new(),
            pending: BytesMut::new(),
        });
        self.by_fd.insert(fd, slot);
        self.by_peer.insert(peer, slot);
        self.deliver_entry(reactor, slot, SocketEventKind::Open)
    }

    fn entry_read_ready(&mut self, reactor: &mut Reactor, slot: usize) -> Result<(), HandlerError> {
        let mut chunk = [0u8; RECV_CHUNK];
        let outcome = match self.entries.get_mut(slot) {
            Some(entry) => {
                let mut stream = &entry.stream;
                match stream.read(&mut chunk) {
                    Ok(n) => {
                        if n > 0 {
                            entry.rx.extend_from_slice(&chunk[..n]);
                        }
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                warn!(slot, "read event for a removed connection");
                return Ok(());
            }
        };
        match outcome {
            Ok(0) => self.drop_entry(reactor, slot, true),
            Ok(_) => self.deliver_entry(reactor, slot, SocketEventKind::Data),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                debug!(error = %e, "read failed");
                self.drop_entry(reactor, slot, true)
            }
        }
    }

    fn entry_write_ready(&mut self, reactor: &mut Reactor, slot: usize) -> Result<(), HandlerError> {
        let outcome = match self.entries.get_mut(slot) {
            Some(entry) => flush_pending(&entry.stream, &mut entry.pending)
                .map(|drained| (entry.stream.as_raw_fd(), drained)),
            None => {
                warn!(slot, "write event for a removed connection");
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
                self.drop_entry(reactor, slot, true)
            }
        }
    }

    /// Remove one entry: unregister its socket, optionally deliver
    /// `Close` first (while the peer address is still queryable), then
    /// drop it. Other connections are untouched.
    fn drop_entry(
        &mut self,
        reactor: &mut Reactor,
        slot: usize,
        notify: bool,
    ) -> Result<(), HandlerError> {
        let fd = match self.entries.get(slot) {
            Some(entry) => entry.stream.as_raw_fd(),
            None => return Ok(()),
        };
        if reactor.registered_mask(fd).is_some() {
            let _ = reactor.clear_fd_mask(fd, EventMask::all());
        }
        let result = if notify {
            self.deliver_entry(reactor, slot, SocketEventKind::Close)
        } else {
            Ok(())
        };
        if self.entries.contains(slot) {
            let entry = self.entries.remove(slot);
            self.by_fd.remove(&fd);
            self.by_peer.remove(&entry.peer);
        }
        result
    }

    /// Invoke the sink for one entry with disjoint borrows of its
    /// parts, then apply whatever the callback requested.
    fn deliver_entry(
        &mut self,
        reactor: &mut Reactor,
        slot: usize,
        kind: SocketEventKind,
    ) -> Result<(), HandlerError> {
        let sink = self.sink.clone();
        let mut want_write = false;
        let mut close_after = false;
        {
            let Some(entry) = self.entries.get_mut(slot) else {
                return Ok(());
            };
            let open = kind != SocketEventKind::Close;
            let peer = entry.peer;
            let mut ctx = ConnectionCtx::new(
                if open { Some(&entry.stream) } else { None },
                &mut entry.pending,
                Some(peer),
                open,
                &mut want_write,
                &mut close_after,
            );
            let event = SocketEvent {
                kind,
                peer: Some(peer),
                buffer: &mut entry.rx,
            };
            sink.borrow_mut().on_event(&mut ctx, event)?;
        }
        if want_write {
            self.arm_entry_write(reactor, slot);
        }
        if close_after {
            self.drop_entry(reactor, slot, false)?;
        }
        Ok(())
    }
}

impl EventHandler for TcpServer {
    fn handle(
        &mut self,
        reactor: &mut Reactor,
        event: &EventContext,
    ) -> Result<(), HandlerError> {
        let fd = match event.token {
            EventToken::Fd(fd) => fd,
            EventToken::Timer => {
                warn!("timer event delivered to a TCP server");
                return Ok(());
            }
        };
        if self.listener.as_ref().map(|l| l.as_raw_fd()) == Some(fd) {
            return match event.category {
                Category::Read => self.accept_ready(reactor),
                category => {
                    warn!(fd, ?category, "unexpected event on the listening socket");
                    Ok(())
                }
            };
        }
        let Some(slot) = self.by_fd.get(&fd).copied() else {
            warn!(fd, "event for an unknown descriptor");
            return Ok(());
        };
        match event.category {
            Category::Read => self.entry_read_ready(reactor, slot),
            Category::Write => self.entry_write_ready(reactor, slot),
            Category::Error => {
                debug!(fd, "error condition on connection");
                self.drop_entry(reactor, slot, true)
            }
            Category::Timer => Ok(()),
        }
    }
}
