//! UDP per-source fan-out: one bound socket, a chain of handlers.
//!
//! Each arriving datagram is offered to the port's handlers in
//! registration order; the first one that claims it stops the chain.
//! A datagram nobody claims is logged and dropped; that is not an
//! error.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use socket2::{Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{HandlerError, SocketError};
use crate::handler::{EventHandler, HandlerRc};
use crate::reactor::Reactor;
use crate::tcp::domain_for;
use crate::types::{Category, EventContext, EventMask, EventToken};

/// Largest datagram the port will receive.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Shared reference to a datagram sink.
pub type DatagramSinkRc = Rc<RefCell<dyn DatagramSink>>;

/// One received datagram.
pub struct Datagram<'a> {
    /// The payload.
    pub bytes: &'a [u8],
    /// Sender address and port.
    pub source: SocketAddr,
}

/// A sink's verdict on an offered datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramVerdict {
    /// The sink consumed the datagram; the chain stops here.
    Claimed,
    /// Not for this sink; offer it to the next one.
    Ignored,
}

/// Reply access handed to a [`DatagramSink`] during delivery.
///
/// The port itself is mutably borrowed for the duration of the
/// callback, so replies go through this instead.
pub struct UdpResponder<'a> {
    socket: &'a UdpSocket,
}

impl UdpResponder<'_> {
    /// Send a datagram from the port's socket.
    pub fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest)
    }

    /// Local address of the port's socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// Handler offered datagrams arriving on a shared port.
pub trait DatagramSink {
    /// Inspect one datagram and claim it or pass.
    fn on_datagram(
        &mut self,
        port: &mut UdpResponder<'_>,
        datagram: &Datagram<'_>,
    ) -> DatagramVerdict;
}

/// A bound UDP socket fanning datagrams out to an ordered handler
/// chain.
pub struct UdpPort {
    socket: Option<UdpSocket>,
    sinks: Vec<DatagramSinkRc>,
    scratch: Vec<u8>,
}

impl UdpPort {
    /// Bind `addr` and register the socket with the reactor.
    pub fn open(reactor: &mut Reactor, addr: SocketAddr) -> Result<Rc<RefCell<UdpPort>>, SocketError> {
        let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();

        let port = Rc::new(RefCell::new(UdpPort {
            socket: None,
            sinks: Vec::new(),
            scratch: vec![0u8; MAX_DATAGRAM],
        }));
        let handler: HandlerRc = port.clone();
        reactor.set_fd_mask(socket.as_raw_fd(), EventMask::READABLE, handler)?;
        port.borrow_mut().socket = Some(socket);
        Ok(port)
    }

    /// Append a sink to the chain. Order of joining is the offer order.
    /// The chain is only consulted between dispatches, so joining from
    /// inside a callback takes effect for the next datagram.
    pub fn join(&mut self, sink: DatagramSinkRc) {
        self.sinks.push(sink);
    }

    /// Remove a sink from the chain. Returns whether it was present.
    pub fn leave(&mut self, sink: &DatagramSinkRc) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|s| !Rc::ptr_eq(s, sink));
        self.sinks.len() != before
    }

    /// Number of sinks in the chain.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Send a datagram from the port's socket.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<usize, SocketError> {
        let socket = self.socket.as_ref().ok_or(SocketError::NotConnected)?;
        Ok(socket.send_to(data, dest)?)
    }

    /// Unregister and drop the socket. The sink chain is kept.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(socket) = self.socket.take() {
            let fd = socket.as_raw_fd();
            if reactor.registered_mask(fd).is_some() {
                let _ = reactor.clear_fd_mask(fd, EventMask::all());
            }
        }
    }

    fn read_ready(&mut self) -> Result<(), HandlerError> {
        let Some(socket) = self.socket.as_ref() else {
            warn!("read event without a socket");
            return Ok(());
        };
        let (len, source) = match socket.recv_from(&mut self.scratch) {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                // Transient per-socket errors (e.g. a reflected
                // ECONNREFUSED) do not take the port down.
                debug!(error = %e, "recv failed");
                return Ok(());
            }
        };

        // Snapshot the chain so sinks joining or leaving from inside a
        // callback never race the traversal.
        let chain: Vec<DatagramSinkRc> = self.sinks.clone();
        let datagram = Datagram {
            bytes: &self.scratch[..len],
            source,
        };
        let mut responder = UdpResponder { socket };
        for sink in &chain {
            if sink.borrow_mut().on_datagram(&mut responder, &datagram) == DatagramVerdict::Claimed
            {
                return Ok(());
            }
        }
        debug!(%source, len, "datagram unhandled");
        Ok(())
    }
}

impl EventHandler for UdpPort {
    fn handle(
        &mut self,
        _reactor: &mut Reactor,
        event: &EventContext,
    ) -> Result<(), HandlerError> {
        match (event.token, event.category) {
            (EventToken::Fd(_), Category::Read) => self.read_ready(),
            (EventToken::Fd(fd), category) => {
                warn!(fd, ?category, "unexpected event on UDP port");
                Ok(())
            }
            (EventToken::Timer, _) => {
                warn!("timer event delivered to a UDP port");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct CountingSink {
        verdict: DatagramVerdict,
        seen: usize,
    }

    impl DatagramSink for CountingSink {
        fn on_datagram(
            &mut self,
            _port: &mut UdpResponder<'_>,
            _datagram: &Datagram<'_>,
        ) -> DatagramVerdict {
            self.seen += 1;
            self.verdict
        }
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_open_registers_socket() {
        let mut reactor = Reactor::new();
        let port = UdpPort::open(&mut reactor, loopback()).unwrap();
        assert_eq!(reactor.registration_count(), 1);
        let addr = port.borrow().local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_join_and_leave() {
        let mut reactor = Reactor::new();
        let port = UdpPort::open(&mut reactor, loopback()).unwrap();
        let sink: DatagramSinkRc = Rc::new(RefCell::new(CountingSink {
            verdict: DatagramVerdict::Ignored,
            seen: 0,
        }));
        port.borrow_mut().join(sink.clone());
        assert_eq!(port.borrow().sink_count(), 1);
        assert!(port.borrow_mut().leave(&sink));
        assert_eq!(port.borrow().sink_count(), 0);
        assert!(!port.borrow_mut().leave(&sink));
    }

    #[test]
    fn test_close_clears_registration() {
        let mut reactor = Reactor::new();
        let port = UdpPort::open(&mut reactor, loopback()).unwrap();
        port.borrow_mut().close(&mut reactor);
        assert_eq!(reactor.registration_count(), 0);
    }
}
