//! Manage iterative queries and their corresponding request/response.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    messages::{
        FindNodeRequestArguments, FindValueRequestArguments, NodesReplyArguments,
        ValuesReplyArguments,
    },
    ClosestContacts, Contact, DiversificationType, Id, Reply, Request, StoredValue, Token,
    ValueFlags, ID_SIZE,
};
use crate::transport::Transport;

/// Bound on requests a single query sends, in multiples of `k`.
const MAX_REQUESTS_PER_K: usize = 8;

/// Number of leading key bytes an obfuscated lookup target shares with the key.
const OBFUSCATED_PREFIX: usize = 12;

/// A routing target near `key` that doesn't reveal it.
pub fn obfuscated_target(key: &Id) -> Id {
    let mut bytes: [u8; ID_SIZE] = rand::random();
    bytes[..OBFUSCATED_PREFIX].copy_from_slice(&key.as_bytes()[..OBFUSCATED_PREFIX]);

    bytes.into()
}

#[derive(Debug, Clone)]
/// Progress reported by a query, drained with [IterativeQuery::take_events].
pub enum QueryEvent {
    /// New requests were sent.
    Searching { contacted: usize, active: usize },
    /// A value not seen before in this query.
    Read { from: Contact, value: StoredValue },
}

#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    /// Number of closest responders the query tries to reach.
    pub k: usize,
    /// Maximum outstanding requests.
    pub concurrency: usize,
    /// Stop after this many values, `0` for no bound.
    pub max_values: usize,
    /// Keep searching after the first couple of value replies.
    pub exhaustive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Done,
    Cancelled,
}

/// An iterative process of concurrently sending a request to the closest known nodes to
/// the target, learning closer nodes from the responses, and repeating this process
/// until the closest responders are all queried, or enough values were found.
#[derive(Debug)]
pub struct IterativeQuery {
    local_id: Id,
    request: Request,
    settings: QuerySettings,
    state: State,

    candidates: ClosestContacts,
    responders: ClosestContacts,
    without_value: ClosestContacts,
    tokens: HashMap<Id, Token>,

    visited: HashSet<SocketAddr>,
    inflight: HashMap<u32, SocketAddr>,
    requests_sent: usize,

    values: Vec<StoredValue>,
    seen_values: HashSet<(Id, Bytes)>,
    value_replies: usize,
    diversification: Option<(Contact, DiversificationType)>,

    events: Vec<QueryEvent>,
}

impl IterativeQuery {
    /// Lookup of the contacts closest to `target`.
    pub fn find_node(local_id: Id, target: Id, settings: QuerySettings) -> Self {
        Self::new(
            local_id,
            Request::FindNode(FindNodeRequestArguments { target }),
            target,
            settings,
        )
    }

    /// Lookup of the values stored at `arguments.key`, routed toward `arguments.target`.
    pub fn find_value(
        local_id: Id,
        arguments: FindValueRequestArguments,
        settings: QuerySettings,
    ) -> Self {
        let target = arguments.target;

        Self::new(local_id, Request::FindValue(arguments), target, settings)
    }

    fn new(local_id: Id, request: Request, target: Id, settings: QuerySettings) -> Self {
        trace!(?target, ?request, "New Query");

        Self {
            local_id,
            request,
            settings,
            state: State::Running,

            candidates: ClosestContacts::new(target),
            responders: ClosestContacts::new(target),
            without_value: ClosestContacts::new(target),
            tokens: HashMap::new(),

            visited: HashSet::new(),
            inflight: HashMap::new(),
            requests_sent: 0,

            values: Vec::new(),
            seen_values: HashSet::new(),
            value_replies: 0,
            diversification: None,

            events: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.responders.target()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_value_search(&self) -> bool {
        matches!(self.request, Request::FindValue(_))
    }

    /// Closest nodes according to other nodes.
    pub fn candidates(&self) -> &ClosestContacts {
        &self.candidates
    }

    /// Every contact that responded, closest first.
    pub fn responders(&self) -> &ClosestContacts {
        &self.responders
    }

    /// The `k` closest responders.
    pub fn closest(&self) -> Vec<Contact> {
        self.responders
            .contacts()
            .iter()
            .take(self.settings.k)
            .cloned()
            .collect()
    }

    /// Responders of a value search that didn't have the value, closest first.
    pub fn without_value(&self) -> &ClosestContacts {
        &self.without_value
    }

    /// Write token a responder handed us.
    pub fn token(&self, id: &Id) -> Option<Token> {
        self.tokens.get(id).copied()
    }

    pub fn values(&self) -> &[StoredValue] {
        &self.values
    }

    /// Diversification reported by a responder, which ended this query.
    pub fn diversification(&self) -> Option<&(Contact, DiversificationType)> {
        self.diversification.as_ref()
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    pub fn is_done(&self) -> bool {
        self.state != State::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == State::Cancelled
    }

    /// Return true if a response (by transaction_id) is expected by this query.
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight.contains_key(&transaction_id)
    }

    // === Public Methods ===

    /// Add a candidate node to query on next tick if it is among the closest nodes.
    pub fn add_candidate(&mut self, contact: Contact) {
        if contact.id() != &self.local_id {
            self.candidates.add(contact);
        }
    }

    /// Visit an address whose Id we don't know yet, like a bootstrapping node.
    pub fn visit(&mut self, transport: &mut dyn Transport, address: SocketAddr) {
        if self.is_done() || self.visited.contains(&address) {
            return;
        }

        let request = self.next_request();
        let transaction_id = transport.request(address, request);

        self.inflight.insert(transaction_id, address);
        self.visited.insert(address);
        self.requests_sent += 1;
    }

    /// Stop the query; replies still inflight will be ignored.
    pub fn cancel(&mut self) {
        if self.state == State::Running {
            debug!(target = ?self.target(), "Cancelled query");
            self.state = State::Cancelled;
        }
    }

    /// Handle a reply to one of this query's requests.
    pub fn on_reply(&mut self, transaction_id: u32, from: &Contact, reply: &Reply) {
        if self.inflight.remove(&transaction_id).is_none() || self.is_done() {
            return;
        }

        match reply {
            Reply::Nodes(NodesReplyArguments {
                contacts,
                token,
                diversification,
            }) => {
                self.add_responder(from, *token);

                if self.is_value_search() {
                    self.without_value.add(from.clone());
                    self.note_diversification(from, *diversification);
                }

                for contact in contacts {
                    self.add_candidate(contact.clone());
                }
            }
            Reply::Values(ValuesReplyArguments {
                values,
                token,
                diversification,
            }) => {
                self.add_responder(from, *token);
                self.value_replies += 1;

                for value in values {
                    let id = (*value.origin().id(), value.payload().clone());

                    if self.seen_values.insert(id) {
                        self.values.push(value.clone());
                        self.events.push(QueryEvent::Read {
                            from: from.clone(),
                            value: value.clone(),
                        });
                    }
                }

                self.note_diversification(from, *diversification);
            }
            Reply::Error(error) => {
                debug!(target = ?self.target(), ?error, from = ?from.id(), "Query got error response");
            }
            Reply::Pong | Reply::Stored(_) | Reply::Removed(_) => {}
        }
    }

    /// Handle a request of this query that timed out.
    pub fn on_timeout(&mut self, transaction_id: u32) -> Option<SocketAddr> {
        self.inflight.remove(&transaction_id)
    }

    /// Query closest nodes for this query's target.
    ///
    /// Returns true if it is done.
    pub fn tick(&mut self, transport: &mut dyn Transport) -> bool {
        if self.is_done() {
            return true;
        }

        if self.satisfied() {
            return self.finish("enough values");
        }

        let sent = self.visit_closest(transport);

        if sent > 0 {
            self.events.push(QueryEvent::Searching {
                contacted: self.requests_sent,
                active: self.inflight.len(),
            });
        }

        if self.inflight.is_empty() {
            return self.finish("no candidates left");
        }

        false
    }

    pub fn take_events(&mut self) -> Vec<QueryEvent> {
        std::mem::take(&mut self.events)
    }

    // === Private Methods ===

    fn next_request(&self) -> Request {
        match &self.request {
            Request::FindValue(arguments) if self.settings.max_values > 0 => {
                let remaining = self.settings.max_values.saturating_sub(self.values.len()).max(1);

                Request::FindValue(FindValueRequestArguments {
                    max_values: remaining.min(u16::MAX as usize) as u16,
                    ..arguments.clone()
                })
            }
            request => request.clone(),
        }
    }

    fn add_responder(&mut self, from: &Contact, token: Token) {
        self.responders.add(from.clone());
        self.tokens.insert(*from.id(), token);
    }

    fn note_diversification(&mut self, from: &Contact, diversification: DiversificationType) {
        if diversification.is_none() || self.diversification.is_some() {
            return;
        }

        let flags = match &self.request {
            Request::FindValue(FindValueRequestArguments { flags, .. }) => *flags,
            _ => ValueFlags::default(),
        };

        // Stats are about the key itself, not where its values moved to.
        if flags.contains(ValueFlags::STATS) {
            return;
        }

        debug!(target = ?self.target(), ?diversification, from = ?from.id(), "Query found diversified key");

        self.diversification = Some((from.clone(), diversification));
    }

    fn satisfied(&self) -> bool {
        if self.diversification.is_some() {
            return true;
        }

        if !self.is_value_search() {
            return false;
        }

        let flags = match &self.request {
            Request::FindValue(FindValueRequestArguments { flags, .. }) => *flags,
            _ => ValueFlags::default(),
        };

        let max_values = self.settings.max_values;

        (max_values > 0 && self.values.len() >= max_values)
            || (!self.settings.exhaustive
                && !flags.contains(ValueFlags::STATS)
                && self.value_replies >= 2)
    }

    /// Visit the closest candidates not visited yet, returns the number of requests sent.
    fn visit_closest(&mut self, transport: &mut dyn Transport) -> usize {
        let max_requests = self.settings.k * MAX_REQUESTS_PER_K;
        let mut sent = 0;

        while self.inflight.len() < self.settings.concurrency && self.requests_sent < max_requests
        {
            let Some(next) = self
                .candidates
                .contacts()
                .iter()
                .find(|contact| !self.visited.contains(&contact.address()))
                .cloned()
            else {
                break;
            };

            // We have heard from the k closest and the rest are further away.
            if self.responders.len() >= self.settings.k
                && !self
                    .responders
                    .is_closer_than_nth(next.id(), self.settings.k - 1)
            {
                break;
            }

            self.visit(transport, next.address());
            sent += 1;
        }

        sent
    }

    fn finish(&mut self, reason: &'static str) -> bool {
        self.state = State::Done;

        debug!(
            target = ?self.target(),
            reason,
            candidates = self.candidates.len(),
            visited = self.visited.len(),
            responders = self.responders.len(),
            values = self.values.len(),
            "Done query"
        );

        true
    }
}
