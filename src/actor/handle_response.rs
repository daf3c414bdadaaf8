use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{Contact, FailureOutcome, Id, Reply};
use crate::transport::TransportEvent;

use super::operation::Context;
use super::Actor;

impl Actor {
    pub(super) fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Request {
                from,
                transaction_id,
                request,
            } => self.handle_request(from, transaction_id, request),
            TransportEvent::Reply {
                from,
                transaction_id,
                reply,
                rtt,
            } => self.handle_reply(from, transaction_id, reply, rtt),
            TransportEvent::Timeout { transaction_id, to } => {
                self.handle_timeout(transaction_id, to)
            }
        }
    }

    /// Handle a reply: refresh the responder in the routing table, and hand
    /// the reply to the ping or operation waiting for it.
    fn handle_reply(&mut self, from: Contact, transaction_id: u32, reply: Reply, rtt: Duration) {
        self.routing_table
            .note_contact(from.clone().with_rtt(rtt), true);

        if self.pings.remove(&transaction_id).is_some() {
            trace!(from = ?from.id(), ?rtt, "Pong");
            return;
        }

        let matched = self
            .operations
            .iter_mut()
            .any(|operation| operation.on_reply(transaction_id, &from, &reply));

        if !matched {
            trace!(from = ?from.id(), transaction_id, "Reply to a finished operation");
        }
    }

    /// Handle a timed out request: count a failure against the contact, and
    /// let the operation move on.
    fn handle_timeout(&mut self, transaction_id: u32, to: SocketAddr) {
        let id = self
            .pings
            .remove(&transaction_id)
            .or_else(|| contact_at(self, &to));

        if let Some(id) = id {
            if let FailureOutcome::Evicted { promoted } = self.routing_table.note_failure(&id) {
                debug!(
                    evicted = ?id,
                    promoted = ?promoted.as_ref().map(|c| *c.id()),
                    "Evicted unresponsive contact"
                );
            }
        }

        let mut spawned = Vec::new();
        let mut punches = Vec::new();
        let mut integration_done = false;

        let mut operations = std::mem::take(&mut self.operations);

        {
            let mut cx: Context<'_> =
                self.context(&mut spawned, &mut punches, &mut integration_done);

            for operation in operations.iter_mut() {
                if operation.on_timeout(&mut cx, transaction_id) {
                    break;
                }
            }
        }

        self.operations = operations;
        self.after_context(spawned, punches, integration_done);
    }
}

fn contact_at(actor: &Actor, address: &SocketAddr) -> Option<Id> {
    actor
        .routing_table
        .contacts()
        .find(|contact| &contact.address() == address)
        .map(|contact| *contact.id())
}
