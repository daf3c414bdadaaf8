//! Boundary between the DHT and the network.
//!
//! The DHT never encodes messages itself: it hands structured [Request]s
//! to a [Transport] and reacts to the [TransportEvent]s it yields.

mod inflight_requests;
mod memory;

use std::{fmt::Debug, net::SocketAddr, time::Duration};

use crate::common::{Contact, Reply, Request};

pub use inflight_requests::{InflightRequest, InflightRequests};
pub use memory::{MemoryNetwork, MemoryTransport};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Sends requests and replies on behalf of one DHT node.
pub trait Transport: Debug + Send {
    /// This node's contact, as remote nodes see it.
    fn local_contact(&self) -> &Contact;

    /// Send a request and return its transaction id.
    ///
    /// Every request eventually yields exactly one [TransportEvent::Reply]
    /// or [TransportEvent::Timeout] with that transaction id.
    fn request(&mut self, to: SocketAddr, request: Request) -> u32;

    /// Answer a request received as [TransportEvent::Request].
    fn reply(&mut self, to: SocketAddr, transaction_id: u32, reply: Reply);

    /// Wait up to `timeout` for the next event.
    fn recv(&mut self, timeout: Duration) -> Option<TransportEvent>;

    /// Stop or resume sending and receiving.
    fn set_suspended(&mut self, _suspended: bool) {}
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote node sent us a request.
    Request {
        from: Contact,
        transaction_id: u32,
        request: Request,
    },
    /// A remote node answered one of our requests.
    Reply {
        from: Contact,
        transaction_id: u32,
        reply: Reply,
        rtt: Duration,
    },
    /// One of our requests got no answer in time.
    Timeout {
        transaction_id: u32,
        to: SocketAddr,
    },
}
