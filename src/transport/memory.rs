//! Process local transport, used by [Testnet](crate::Testnet) and tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use flume::{Receiver, Sender};
use tracing::trace;

use crate::common::{Contact, ContactFlags, Id, Reply, Request};

use super::{InflightRequests, Transport, TransportEvent};

const FIRST_PORT: u16 = 10_000;

#[derive(Debug, Clone)]
enum Message {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug)]
struct Envelope {
    network: u8,
    from: Contact,
    transaction_id: u32,
    message: Message,
}

#[derive(Debug, Default)]
struct Switchboard {
    nodes: HashMap<SocketAddr, Sender<Envelope>>,
    blackholed: HashSet<SocketAddr>,
    next_port: u16,
}

#[derive(Debug, Clone, Default)]
/// A switchboard delivering messages between [MemoryTransport]s of the same process.
///
/// Cloning it gives another handle to the same switchboard.
pub struct MemoryNetwork {
    switchboard: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node with a fresh loopback address.
    pub fn bind(&self, id: Id, network: u8, request_timeout: Duration) -> MemoryTransport {
        let (sender, receiver) = flume::unbounded();

        let address = {
            let mut switchboard = self.switchboard();

            let mut port = switchboard.next_port.max(FIRST_PORT);
            let mut address = loopback(port);
            while switchboard.nodes.contains_key(&address) {
                port = port.wrapping_add(1).max(FIRST_PORT);
                address = loopback(port);
            }

            switchboard.next_port = port.wrapping_add(1);
            switchboard.nodes.insert(address, sender);

            address
        };

        trace!(?id, ?address, network, "Bound memory transport");

        MemoryTransport {
            contact: Contact::new(id, address),
            network,
            switchboard: self.clone(),
            receiver,
            inflight: InflightRequests::new(request_timeout),
            next_transaction_id: 0,
            suspended: false,
            expired: VecDeque::new(),
        }
    }

    /// Silently drop all traffic to and from `address`.
    pub fn blackhole(&self, address: SocketAddr) {
        self.switchboard().blackholed.insert(address);
    }

    /// Undo [Self::blackhole].
    pub fn restore(&self, address: SocketAddr) {
        self.switchboard().blackholed.remove(&address);
    }

    pub fn is_blackholed(&self, address: &SocketAddr) -> bool {
        self.switchboard().blackholed.contains(address)
    }

    /// Number of attached nodes.
    pub fn len(&self) -> usize {
        self.switchboard().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Private Methods ===

    fn switchboard(&self) -> MutexGuard<'_, Switchboard> {
        self.switchboard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, to: SocketAddr, envelope: Envelope) {
        let switchboard = self.switchboard();

        if switchboard.blackholed.contains(&to)
            || switchboard.blackholed.contains(&envelope.from.address())
        {
            return;
        }

        if let Some(sender) = switchboard.nodes.get(&to) {
            let _ = sender.send(envelope);
        }
    }

    fn unbind(&self, address: &SocketAddr) {
        self.switchboard().nodes.remove(address);
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[derive(Debug)]
/// [Transport] attached to a [MemoryNetwork].
pub struct MemoryTransport {
    contact: Contact,
    network: u8,
    switchboard: MemoryNetwork,
    receiver: Receiver<Envelope>,
    inflight: InflightRequests,
    next_transaction_id: u32,
    suspended: bool,
    expired: VecDeque<TransportEvent>,
}

impl MemoryTransport {
    /// Advertise capabilities to remote nodes.
    pub fn with_flags(mut self, flags: ContactFlags) -> Self {
        self.contact = self.contact.clone().with_flags(flags);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.contact.address()
    }

    // === Private Methods ===

    fn accept(&mut self, envelope: Envelope) -> Option<TransportEvent> {
        if self.suspended || envelope.network != self.network {
            return None;
        }

        match envelope.message {
            Message::Request(request) => Some(TransportEvent::Request {
                from: envelope.from,
                transaction_id: envelope.transaction_id,
                request,
            }),
            Message::Reply(reply) => {
                let inflight = self
                    .inflight
                    .remove(envelope.transaction_id, &envelope.from.address())?;

                Some(TransportEvent::Reply {
                    from: envelope.from,
                    transaction_id: envelope.transaction_id,
                    reply,
                    rtt: inflight.sent_at.elapsed(),
                })
            }
        }
    }

    fn send(&self, to: SocketAddr, transaction_id: u32, message: Message) {
        if self.suspended {
            return;
        }

        self.switchboard.deliver(
            to,
            Envelope {
                network: self.network,
                from: self.contact.clone(),
                transaction_id,
                message,
            },
        );
    }
}

impl Transport for MemoryTransport {
    fn local_contact(&self) -> &Contact {
        &self.contact
    }

    fn request(&mut self, to: SocketAddr, request: Request) -> u32 {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);

        self.inflight.add(transaction_id, to);
        self.send(to, transaction_id, Message::Request(request));

        transaction_id
    }

    fn reply(&mut self, to: SocketAddr, transaction_id: u32, reply: Reply) {
        self.send(to, transaction_id, Message::Reply(reply));
    }

    fn recv(&mut self, timeout: Duration) -> Option<TransportEvent> {
        let now = Instant::now();

        for (transaction_id, request) in self.inflight.take_expired(now) {
            self.expired.push_back(TransportEvent::Timeout {
                transaction_id,
                to: request.to,
            });
        }

        if let Some(event) = self.expired.pop_front() {
            return Some(event);
        }

        let wait = self
            .inflight
            .next_expiry(now)
            .map(|expiry| expiry.min(timeout))
            .unwrap_or(timeout);

        let envelope = if wait.is_zero() {
            self.receiver.try_recv().ok()?
        } else {
            self.receiver.recv_timeout(wait).ok()?
        };

        self.accept(envelope)
    }

    fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.switchboard.unbind(&self.contact.address());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::messages::FindNodeRequestArguments;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn recv_until(transport: &mut MemoryTransport) -> TransportEvent {
        let deadline = Instant::now() + Duration::from_secs(2);

        loop {
            if let Some(event) = transport.recv(Duration::from_millis(10)) {
                return event;
            }
            assert!(Instant::now() < deadline, "no event");
        }
    }

    #[test]
    fn request_reply() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(Id::random(), 0, TIMEOUT);
        let mut b = network.bind(Id::random(), 0, TIMEOUT);

        assert_ne!(a.address(), b.address());
        assert_eq!(network.len(), 2);

        let tid = a.request(b.address(), Request::Ping);

        match recv_until(&mut b) {
            TransportEvent::Request {
                from,
                transaction_id,
                request: Request::Ping,
            } => {
                assert_eq!(from.id(), a.local_contact().id());
                b.reply(from.address(), transaction_id, Reply::Pong);
            }
            event => panic!("unexpected {event:?}"),
        }

        match recv_until(&mut a) {
            TransportEvent::Reply {
                transaction_id,
                reply: Reply::Pong,
                ..
            } => assert_eq!(transaction_id, tid),
            event => panic!("unexpected {event:?}"),
        }
    }

    #[test]
    fn blackholed_node_times_out() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(Id::random(), 0, TIMEOUT);
        let b = network.bind(Id::random(), 0, TIMEOUT);

        network.blackhole(b.address());

        let tid = a.request(
            b.address(),
            Request::FindNode(FindNodeRequestArguments {
                target: Id::random(),
            }),
        );

        let started = Instant::now();

        match recv_until(&mut a) {
            TransportEvent::Timeout { transaction_id, to } => {
                assert_eq!(transaction_id, tid);
                assert_eq!(to, b.address());
                assert!(started.elapsed() >= TIMEOUT - Duration::from_millis(50));
            }
            event => panic!("unexpected {event:?}"),
        }
    }

    #[test]
    fn networks_are_isolated() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(Id::random(), 0, TIMEOUT);
        let mut b = network.bind(Id::random(), 1, TIMEOUT);

        a.request(b.address(), Request::Ping);

        assert!(b.recv(Duration::from_millis(50)).is_none());
        assert!(matches!(
            recv_until(&mut a),
            TransportEvent::Timeout { .. }
        ));
    }

    #[test]
    fn advertised_flags_reach_remote() {
        let network = MemoryNetwork::new();
        let mut a = network
            .bind(Id::random(), 0, TIMEOUT)
            .with_flags(ContactFlags {
                accepts_nat_punch: true,
            });
        let mut b = network.bind(Id::random(), 0, TIMEOUT);

        assert!(a.local_contact().flags().accepts_nat_punch);

        a.request(b.address(), Request::Ping);

        match recv_until(&mut b) {
            TransportEvent::Request { from, .. } => assert!(from.flags().accepts_nat_punch),
            event => panic!("unexpected {event:?}"),
        }

        drop(a);
        assert_eq!(network.len(), 1);
    }

    #[test]
    fn dropped_transport_unbinds() {
        let network = MemoryNetwork::new();
        let a = network.bind(Id::random(), 0, TIMEOUT);

        drop(a);

        assert!(network.is_empty());
    }
}
