use tracing::trace;

use crate::common::{Contact, Request};

use super::Actor;

impl Actor {
    /// Handle an inbound request: note the requester and answer from the server.
    pub(super) fn handle_request(&mut self, from: Contact, transaction_id: u32, request: Request) {
        trace!(from = ?from.id(), ?request, "Handling request");

        // A request alone doesn't prove the requester is reachable, but it is
        // how the first nodes of a network learn about each other.
        self.routing_table.note_contact(from.clone(), false);

        let reply =
            self.server
                .handle_request(&self.routing_table, &mut self.store, &from, request);

        self.transport.reply(from.address(), transaction_id, reply);
    }
}
