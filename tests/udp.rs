//! Integration tests for UDP per-source fan-out.

use event_driver::{
    Datagram, DatagramSink, DatagramSinkRc, DatagramVerdict, Reactor, UdpPort, UdpResponder,
};
use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

type OfferLog = Rc<RefCell<Vec<(usize, SocketAddr, Vec<u8>)>>>;

/// Records every offer in a shared log and answers with a fixed verdict.
struct ChainSink {
    label: usize,
    verdict: DatagramVerdict,
    log: OfferLog,
}

impl DatagramSink for ChainSink {
    fn on_datagram(
        &mut self,
        _port: &mut UdpResponder<'_>,
        datagram: &Datagram<'_>,
    ) -> DatagramVerdict {
        self.log
            .borrow_mut()
            .push((self.label, datagram.source, datagram.bytes.to_vec()));
        self.verdict
    }
}

/// Claims everything and echoes it to the sender.
struct EchoSink;

impl DatagramSink for EchoSink {
    fn on_datagram(
        &mut self,
        port: &mut UdpResponder<'_>,
        datagram: &Datagram<'_>,
    ) -> DatagramVerdict {
        let _ = port.send_to(datagram.bytes, datagram.source);
        DatagramVerdict::Claimed
    }
}

fn chain_sink(label: usize, verdict: DatagramVerdict, log: &OfferLog) -> DatagramSinkRc {
    Rc::new(RefCell::new(ChainSink {
        label,
        verdict,
        log: log.clone(),
    }))
}

/// Send and wait until the datagram is visible at the destination, so
/// the following `dispatch_once` cannot race the network stack.
fn send_and_settle(sender: &UdpSocket, dest: SocketAddr, payload: &[u8]) {
    sender.send_to(payload, dest).unwrap();
    std::thread::sleep(Duration::from_millis(10));
}

#[test]
fn test_fanout_offers_in_order_until_claimed() {
    let mut reactor = Reactor::new();
    let log: OfferLog = Rc::new(RefCell::new(Vec::new()));

    let port = UdpPort::open(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = port.borrow().local_addr().unwrap();

    // A passes, B claims, C never gets a look.
    port.borrow_mut()
        .join(chain_sink(0, DatagramVerdict::Ignored, &log));
    port.borrow_mut()
        .join(chain_sink(1, DatagramVerdict::Claimed, &log));
    port.borrow_mut()
        .join(chain_sink(2, DatagramVerdict::Claimed, &log));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_and_settle(&client, addr, b"payload");

    reactor.dispatch_once().unwrap();

    let offers: Vec<usize> = log.borrow().iter().map(|(label, _, _)| *label).collect();
    assert_eq!(offers, vec![0, 1]);
    let client_addr = client.local_addr().unwrap();
    for (_, source, bytes) in log.borrow().iter() {
        assert_eq!(*source, client_addr);
        assert_eq!(bytes, b"payload");
    }
}

#[test]
fn test_unclaimed_datagram_is_not_an_error() {
    let mut reactor = Reactor::new();
    let log: OfferLog = Rc::new(RefCell::new(Vec::new()));

    let port = UdpPort::open(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = port.borrow().local_addr().unwrap();
    port.borrow_mut()
        .join(chain_sink(0, DatagramVerdict::Ignored, &log));
    port.borrow_mut()
        .join(chain_sink(1, DatagramVerdict::Ignored, &log));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_and_settle(&client, addr, b"nobody wants this");

    // The whole chain passed; the dispatch still succeeds.
    reactor.dispatch_once().unwrap();
    let offers: Vec<usize> = log.borrow().iter().map(|(label, _, _)| *label).collect();
    assert_eq!(offers, vec![0, 1]);
}

#[test]
fn test_each_datagram_fans_out_independently() {
    let mut reactor = Reactor::new();
    let log: OfferLog = Rc::new(RefCell::new(Vec::new()));

    let port = UdpPort::open(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = port.borrow().local_addr().unwrap();
    port.borrow_mut()
        .join(chain_sink(0, DatagramVerdict::Ignored, &log));
    port.borrow_mut()
        .join(chain_sink(1, DatagramVerdict::Claimed, &log));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_and_settle(&client, addr, b"one");
    send_and_settle(&client, addr, b"two");

    // One datagram per dispatch step.
    reactor.dispatch_once().unwrap();
    assert_eq!(log.borrow().len(), 2);
    reactor.dispatch_once().unwrap();
    assert_eq!(log.borrow().len(), 4);

    let payloads: Vec<Vec<u8>> = log.borrow().iter().map(|(_, _, b)| b.clone()).collect();
    assert_eq!(payloads[0], b"one");
    assert_eq!(payloads[2], b"two");
}

#[test]
fn test_responder_echo_reaches_sender() {
    let mut reactor = Reactor::new();

    let port = UdpPort::open(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = port.borrow().local_addr().unwrap();
    port.borrow_mut().join(Rc::new(RefCell::new(EchoSink)));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_and_settle(&client, addr, b"marco");
    reactor.dispatch_once().unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 16];
    let (n, source) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"marco");
    assert_eq!(source, addr);
}

#[test]
fn test_chain_mutation_between_dispatches() {
    let mut reactor = Reactor::new();
    let log: OfferLog = Rc::new(RefCell::new(Vec::new()));

    let port = UdpPort::open(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = port.borrow().local_addr().unwrap();
    let first = chain_sink(0, DatagramVerdict::Ignored, &log);
    port.borrow_mut().join(first.clone());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_and_settle(&client, addr, b"first");
    reactor.dispatch_once().unwrap();
    assert_eq!(log.borrow().len(), 1);

    // Joining and leaving between dispatches takes effect for the next
    // datagram: the newcomer claims, the departed sink sees nothing.
    port.borrow_mut()
        .join(chain_sink(7, DatagramVerdict::Claimed, &log));
    assert!(port.borrow_mut().leave(&first));
    send_and_settle(&client, addr, b"second");
    reactor.dispatch_once().unwrap();
    let offers: Vec<usize> = log.borrow().iter().map(|(label, _, _)| *label).collect();
    assert_eq!(offers, vec![0, 7]);
}
