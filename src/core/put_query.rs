use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    messages::{
        ErrorCode, ErrorReply, FindNodeRequestArguments, FindValueRequestArguments,
        RemoveRequestArguments, RemovedReplyArguments, StoreRequestArguments,
        StoredReplyArguments, ValuesReplyArguments,
    },
    Contact, DiversificationType, Id, Reply, Request, StoredValue, Token, ValueFlags,
};
use crate::transport::Transport;

#[derive(Debug, Clone)]
/// What a [FanOut] asks every contact.
pub enum FanOutRequest {
    Store(Vec<StoredValue>),
    Remove,
    FindValue { flags: ValueFlags, max_values: u16 },
}

impl FanOutRequest {
    fn needs_token(&self) -> bool {
        !matches!(self, FanOutRequest::FindValue { .. })
    }
}

#[derive(Debug, Clone)]
/// Per contact outcome reported by a [FanOut], drained with [FanOut::take_events].
pub enum FanOutEvent {
    Wrote { contact: Contact },
    Read { contact: Contact, value: StoredValue },
}

#[derive(Debug)]
/// Once an [IterativeQuery](super::iterative_query::IterativeQuery) is done, sends
/// the same request to a set of contacts, at most `concurrency` at a time, and
/// keeps track of acknowledging contacts and errors.
///
/// Contacts we have no write token for are first asked for closer nodes to
/// the key, which comes with a token.
pub struct FanOut {
    key: Id,
    request: FanOutRequest,
    concurrency: usize,

    pending: VecDeque<Contact>,
    tokens: HashMap<Id, Token>,

    inflight: HashMap<u32, Contact>,
    awaiting_token: HashMap<u32, Contact>,
    awaiting_punch: HashMap<Id, Contact>,
    punched: HashSet<Id>,

    targeted: usize,
    acknowledged: Vec<Contact>,
    removed: usize,
    timeouts: usize,
    errors: Vec<(usize, ErrorCode)>,
    diversification: Option<(Contact, DiversificationType)>,
    redirected: usize,

    seen_values: HashSet<(Id, Bytes)>,
    events: Vec<FanOutEvent>,
}

impl FanOut {
    pub fn new(key: Id, request: FanOutRequest, contacts: Vec<Contact>, concurrency: usize) -> Self {
        trace!(?key, contacts = contacts.len(), "New FanOut");

        Self {
            key,
            request,
            concurrency: concurrency.max(1),

            targeted: contacts.len(),
            pending: contacts.into(),
            tokens: HashMap::new(),

            inflight: HashMap::new(),
            awaiting_token: HashMap::new(),
            awaiting_punch: HashMap::new(),
            punched: HashSet::new(),

            acknowledged: Vec::new(),
            removed: 0,
            timeouts: 0,
            errors: Vec::new(),
            diversification: None,
            redirected: 0,

            seen_values: HashSet::new(),
            events: Vec::new(),
        }
    }

    /// Use a token learned during the lookup.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = (Id, Token)>) -> Self {
        self.tokens.extend(tokens);
        self
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn request(&self) -> &FanOutRequest {
        &self.request
    }

    /// Number of contacts this fan out was started with.
    pub fn targeted(&self) -> usize {
        self.targeted
    }

    /// Contacts that confirmed the request.
    pub fn acknowledged(&self) -> &[Contact] {
        &self.acknowledged
    }

    /// Sum of removed values reported by the contacts.
    pub fn removed(&self) -> usize {
        self.removed
    }

    /// Contacts that didn't reply at all.
    pub fn timeouts(&self) -> usize {
        self.timeouts
    }

    /// Error replies by descending frequency.
    pub fn most_common_error(&self) -> Option<ErrorCode> {
        self.errors.first().map(|(_, code)| *code)
    }

    /// First diversification reported by a contact that refused to store.
    pub fn diversification(&self) -> Option<&(Contact, DiversificationType)> {
        self.diversification.as_ref()
    }

    /// Contacts that refused to store because the key is diversified.
    pub fn redirected(&self) -> usize {
        self.redirected
    }

    /// Return true if a response (by transaction_id) is expected by this fan out.
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight.contains_key(&transaction_id)
            || self.awaiting_token.contains_key(&transaction_id)
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
            && self.inflight.is_empty()
            && self.awaiting_token.is_empty()
            && self.awaiting_punch.is_empty()
    }

    // === Public Methods ===

    /// Send requests to pending contacts, returns true if the fan out is done.
    pub fn tick(&mut self, transport: &mut dyn Transport) -> bool {
        while self.inflight.len() + self.awaiting_token.len() < self.concurrency {
            let Some(contact) = self.pending.pop_front() else {
                break;
            };

            let token = self.tokens.get(contact.id()).copied();

            match (self.request.needs_token(), token) {
                (true, None) => {
                    let transaction_id = transport.request(
                        contact.address(),
                        Request::FindNode(FindNodeRequestArguments { target: self.key }),
                    );
                    self.awaiting_token.insert(transaction_id, contact);
                }
                (_, token) => {
                    let request = self.build_request(token.unwrap_or_default());
                    let transaction_id = transport.request(contact.address(), request);
                    self.inflight.insert(transaction_id, contact);
                }
            }
        }

        self.is_done()
    }

    pub fn on_reply(&mut self, transaction_id: u32, from: &Contact, reply: &Reply) {
        if let Some(contact) = self.awaiting_token.remove(&transaction_id) {
            match reply.token() {
                Some(token) => {
                    self.tokens.insert(*contact.id(), token);
                    self.pending.push_front(contact);
                }
                None => self.record_error(ErrorCode::InvalidToken),
            }

            return;
        }

        let Some(contact) = self.inflight.remove(&transaction_id) else {
            return;
        };

        match reply {
            Reply::Stored(StoredReplyArguments { diversification }) => {
                if diversification.is_none() {
                    self.acknowledge(contact);
                } else {
                    debug!(key = ?self.key, ?diversification, from = ?from.id(), "Store redirected");

                    self.redirected += 1;
                    if self.diversification.is_none() {
                        self.diversification = Some((from.clone(), *diversification));
                    }
                }
            }
            Reply::Removed(RemovedReplyArguments { count }) => {
                self.removed += count;
                self.acknowledge(contact);
            }
            Reply::Values(ValuesReplyArguments { values, .. }) => {
                for value in values {
                    if self
                        .seen_values
                        .insert((*value.origin().id(), value.payload().clone()))
                    {
                        self.events.push(FanOutEvent::Read {
                            contact: from.clone(),
                            value: value.clone(),
                        });
                    }
                }
                self.acknowledged.push(contact);
            }
            // No value there.
            Reply::Nodes(_) => self.acknowledged.push(contact),
            Reply::Error(ErrorReply { code, description }) => {
                debug!(key = ?self.key, ?code, description, from = ?from.id(), "FanOut got error");
                self.record_error(*code);
            }
            Reply::Pong => {}
        }
    }

    /// Handle a timed out request.
    ///
    /// Returns the contact if it should be hole punched, the request is then
    /// retried once on a successful [Self::on_punch].
    pub fn on_timeout(&mut self, transaction_id: u32) -> Option<Contact> {
        if self.awaiting_token.remove(&transaction_id).is_some() {
            self.timeouts += 1;
            return None;
        }

        let contact = self.inflight.remove(&transaction_id)?;

        if contact.flags().accepts_nat_punch && self.punched.insert(*contact.id()) {
            self.awaiting_punch.insert(*contact.id(), contact.clone());
            return Some(contact);
        }

        self.timeouts += 1;
        None
    }

    /// Outcome of hole punching a contact returned by [Self::on_timeout].
    pub fn on_punch(&mut self, id: &Id, success: bool) {
        let Some(contact) = self.awaiting_punch.remove(id) else {
            return;
        };

        if success {
            self.pending.push_front(contact);
        } else {
            self.timeouts += 1;
        }
    }

    pub fn take_events(&mut self) -> Vec<FanOutEvent> {
        std::mem::take(&mut self.events)
    }

    // === Private Methods ===

    fn build_request(&self, token: Token) -> Request {
        match &self.request {
            FanOutRequest::Store(values) => Request::Store(StoreRequestArguments {
                token,
                key: self.key,
                values: values.clone(),
            }),
            FanOutRequest::Remove => Request::Remove(RemoveRequestArguments {
                token,
                key: self.key,
            }),
            FanOutRequest::FindValue { flags, max_values } => {
                Request::FindValue(FindValueRequestArguments {
                    key: self.key,
                    flags: *flags,
                    max_values: *max_values,
                    target: self.key,
                })
            }
        }
    }

    fn acknowledge(&mut self, contact: Contact) {
        self.events.push(FanOutEvent::Wrote {
            contact: contact.clone(),
        });
        self.acknowledged.push(contact);
    }

    fn record_error(&mut self, code: ErrorCode) {
        if let Some(position) = self.errors.iter().position(|(_, c)| *c == code) {
            self.errors[position].0 += 1;

            // Keep the most common error first.
            let mut i = position;
            while i > 0 && self.errors[i].0 > self.errors[i - 1].0 {
                self.errors.swap(i, i - 1);
                i -= 1;
            }
        } else {
            self.errors.push((1, code));
        }
    }
}
