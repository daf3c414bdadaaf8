//! Put, get, remove and lookup operations, each driving a set of lookups and fan outs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use flume::Sender;
use lru::LruCache;
use tracing::{debug, info};

use crate::adapter::StorageAdapter;
use crate::common::{
    messages::{ErrorCode, FindValueRequestArguments},
    ClosestContacts, Contact, Id, Reply, RoutingTable, StoredValue, Token, ValueFlags,
};
use crate::core::iterative_query::{obfuscated_target, IterativeQuery, QueryEvent, QuerySettings};
use crate::core::put_query::{FanOut, FanOutEvent, FanOutRequest};
use crate::core::store::LocalStore;
use crate::error::{PutError, RemoveError};
use crate::transport::Transport;

use super::config::{Config, Quorum};
use super::listener::Listener;

/// Work waiting for a free operation slot.
#[derive(Debug)]
pub(crate) enum Plan {
    /// Closest contacts to a target.
    Lookup {
        target: Id,
        sender: Option<Sender<Vec<Contact>>>,
        integration: bool,
    },
    /// Store values at the closest contacts of their key.
    Put {
        key: Id,
        values: Vec<StoredValue>,
        put_and_forget: bool,
        sender: Option<Sender<Result<Id, PutError>>>,
        listener: Listener,
    },
    Get {
        key: Id,
        flags: ValueFlags,
        max_values: usize,
        /// Fixed when the get was requested, waiting for a slot counts.
        deadline: Option<Instant>,
        exhaustive: bool,
        sender: Sender<StoredValue>,
        listener: Listener,
    },
    Remove {
        key: Id,
        contacts: Option<Vec<Contact>>,
        sender: Sender<Result<usize, RemoveError>>,
        listener: Listener,
    },
    /// Store values found by a get at close contacts that miss them.
    Cache {
        key: Id,
        values: Vec<StoredValue>,
        contacts: Vec<Contact>,
        tokens: Vec<(Id, Token)>,
    },
}

impl Plan {
    /// Complete a get whose deadline passed before it could start, returns
    /// the plan back otherwise.
    pub fn expire(self, now: Instant) -> Option<Plan> {
        match self {
            Plan::Get {
                key,
                deadline: Some(deadline),
                mut listener,
                ..
            } if now >= deadline => {
                debug!(?key, "Get timed out while queued");

                listener.complete(true);
                None
            }
            plan => Some(plan),
        }
    }
}

/// Actor state an operation works with.
pub(crate) struct Context<'a> {
    pub config: &'a Config,
    pub transport: &'a mut dyn Transport,
    pub routing_table: &'a mut RoutingTable,
    pub store: &'a LocalStore,
    pub adapter: &'a Arc<dyn StorageAdapter>,
    pub lookup_cache: &'a mut LruCache<Id, Vec<Contact>>,
    pub cache_rate: &'a mut LruCache<Id, Instant>,
    /// Detached work started by operations.
    pub spawned: &'a mut Vec<Plan>,
    /// Contacts to hole punch.
    pub punches: &'a mut Vec<Contact>,
    /// Set when an integration lookup finished.
    pub integration_done: &'a mut bool,
}

impl Context<'_> {
    fn query_settings(&self, max_values: usize, exhaustive: bool) -> QuerySettings {
        QuerySettings {
            k: self.config.k,
            concurrency: self.config.lookup_concurrency,
            max_values,
            exhaustive,
        }
    }

    /// Seed a query with the closest contacts we know, or the bootstrap nodes.
    fn seed(&mut self, mut query: IterativeQuery) -> IterativeQuery {
        let target = query.target();
        let closest = self.routing_table.find_closest(&target, self.config.k);

        // If we don't have enough or any closest contacts, call the bootstrapping nodes.
        if closest.is_empty() || closest.len() < self.config.bootstrap.len() {
            for address in self.config.bootstrap.clone() {
                query.visit(self.transport, address);
            }
        }

        for contact in closest {
            query.add_candidate(contact);
        }

        if let Some(cached) = self.lookup_cache.get(&target) {
            for contact in cached.clone() {
                query.add_candidate(contact);
            }
        }

        query
    }

    fn find_node(&mut self, target: Id) -> IterativeQuery {
        let query =
            IterativeQuery::find_node(*self.routing_table.id(), target, self.query_settings(0, false));

        self.seed(query)
    }

    fn find_value(
        &mut self,
        key: Id,
        flags: ValueFlags,
        max_values: usize,
        exhaustive: bool,
    ) -> IterativeQuery {
        let query = IterativeQuery::find_value(
            *self.routing_table.id(),
            FindValueRequestArguments {
                key,
                flags,
                max_values: max_values.min(u16::MAX as usize) as u16,
                target: key,
            },
            self.query_settings(max_values, exhaustive),
        );

        self.seed(query)
    }

    /// Remember the closest responders of a finished lookup.
    fn cache_lookup(&mut self, query: &IterativeQuery) {
        let closest = query.closest();

        if closest.is_empty() {
            return;
        }

        self.routing_table.mark_refreshed(&query.target());
        self.lookup_cache.put(query.target(), closest);
    }
}

#[derive(Debug)]
enum Task {
    Lookup {
        /// Key the lookup is about, differs from the query target when obfuscated.
        key: Id,
        query: IterativeQuery,
    },
    FanOut(FanOut),
}

impl Task {
    fn inflight(&self, transaction_id: u32) -> bool {
        match self {
            Task::Lookup { query, .. } => query.inflight(transaction_id),
            Task::FanOut(fan_out) => fan_out.inflight(transaction_id),
        }
    }

    fn tick(&mut self, transport: &mut dyn Transport) -> bool {
        match self {
            Task::Lookup { query, .. } => query.tick(transport),
            Task::FanOut(fan_out) => fan_out.tick(transport),
        }
    }
}

#[derive(Debug)]
struct PutState {
    key: Id,
    values: Vec<StoredValue>,
    replicas: usize,
    quorum: Quorum,
    put_and_forget: bool,
    sender: Option<Sender<Result<Id, PutError>>>,
    tried: HashSet<Id>,
    targeted: usize,
    stored_at: usize,
    timeouts: usize,
    most_common_error: Option<ErrorCode>,
    over_diversified: bool,
    failure: Option<PutError>,
}

#[derive(Debug)]
struct GetState {
    key: Id,
    flags: ValueFlags,
    max_values: usize,
    exhaustive: bool,
    sender: Sender<StoredValue>,
    tried: HashSet<Id>,
    seen: HashSet<(Id, Bytes)>,
}

#[derive(Debug)]
struct RemoveState {
    key: Id,
    sender: Sender<Result<usize, RemoveError>>,
    tried: HashSet<Id>,
    acknowledged: usize,
}

#[derive(Debug)]
enum Kind {
    Lookup {
        sender: Option<Sender<Vec<Contact>>>,
        integration: bool,
    },
    Put(PutState),
    Get(GetState),
    Remove(RemoveState),
    Cache { key: Id },
}

#[derive(Debug)]
/// A running operation.
pub(crate) struct Operation {
    kind: Kind,
    tasks: Vec<Task>,
    listener: Listener,
    deadline: Option<Instant>,
}

impl Operation {
    /// Start the first lookups or fan outs of a plan.
    pub fn start(plan: Plan, cx: &mut Context<'_>) -> Self {
        match plan {
            Plan::Lookup {
                target,
                sender,
                integration,
            } => {
                if integration {
                    debug!(id = ?cx.routing_table.id(), "Integrating");
                }

                let query = cx.find_node(target);

                Operation {
                    kind: Kind::Lookup {
                        sender,
                        integration,
                    },
                    tasks: vec![Task::Lookup { key: target, query }],
                    listener: Listener::none(),
                    deadline: None,
                }
            }
            Plan::Put {
                key,
                values,
                put_and_forget,
                sender,
                listener,
            } => {
                let replicas = values
                    .first()
                    .and_then(|v| v.replication().replicas())
                    .unwrap_or(cx.config.k)
                    .max(1);

                let mut operation = Operation {
                    kind: Kind::Put(PutState {
                        key,
                        values,
                        replicas,
                        quorum: cx.config.put_quorum,
                        put_and_forget,
                        sender,
                        tried: HashSet::new(),
                        targeted: 0,
                        stored_at: 0,
                        timeouts: 0,
                        most_common_error: None,
                        over_diversified: false,
                        failure: None,
                    }),
                    tasks: Vec::new(),
                    listener,
                    deadline: None,
                };

                let keys = cx.adapter.existing_diversification(
                    &key,
                    true,
                    false,
                    cx.config.max_diversification_depth,
                );

                match operation.follow(key, keys) {
                    Ok(keys) => {
                        for key in keys {
                            operation.start_lookup(cx, key);
                        }
                    }
                    Err(error) => operation.fail(error),
                }

                operation
            }
            Plan::Get {
                key,
                flags,
                max_values,
                deadline,
                exhaustive,
                sender,
                listener,
            } => {
                let mut operation = Operation {
                    kind: Kind::Get(GetState {
                        key,
                        flags,
                        max_values,
                        exhaustive,
                        sender,
                        tried: HashSet::new(),
                        seen: HashSet::new(),
                    }),
                    tasks: Vec::new(),
                    listener,
                    deadline,
                };

                if !flags.contains(ValueFlags::STATS) {
                    let local = cx.transport.local_contact().clone();
                    let found = cx
                        .store
                        .get(&key, max_values)
                        .into_iter()
                        .map(|value| (local.clone(), value))
                        .collect();

                    deliver_values(&mut operation.kind, &mut operation.listener, key, found);
                }

                let keys = cx.adapter.existing_diversification(
                    &key,
                    false,
                    exhaustive,
                    cx.config.max_diversification_depth,
                );

                if let Ok(keys) = operation.follow(key, keys) {
                    for key in keys {
                        operation.start_lookup(cx, key);
                    }
                }

                operation
            }
            Plan::Remove {
                key,
                contacts,
                sender,
                listener,
            } => {
                let mut operation = Operation {
                    kind: Kind::Remove(RemoveState {
                        key,
                        sender,
                        tried: HashSet::from([key]),
                        acknowledged: 0,
                    }),
                    tasks: Vec::new(),
                    listener,
                    deadline: None,
                };

                match contacts {
                    Some(contacts) => operation.tasks.push(Task::FanOut(FanOut::new(
                        key,
                        FanOutRequest::Remove,
                        contacts,
                        cx.config.search_concurrency,
                    ))),
                    None => {
                        let keys = cx.adapter.existing_diversification(
                            &key,
                            true,
                            false,
                            cx.config.max_diversification_depth,
                        );

                        if let Ok(keys) = operation.follow(key, keys) {
                            for key in keys {
                                operation.start_lookup(cx, key);
                            }
                        }
                    }
                }

                operation
            }
            Plan::Cache {
                key,
                values,
                contacts,
                tokens,
            } => {
                debug!(?key, contacts = contacts.len(), "Caching values at closest nodes");

                Operation {
                    kind: Kind::Cache { key },
                    tasks: vec![Task::FanOut(
                        FanOut::new(
                            key,
                            FanOutRequest::Store(values),
                            contacts,
                            cx.config.search_concurrency,
                        )
                        .with_tokens(tokens),
                    )],
                    listener: Listener::none(),
                    deadline: None,
                }
            }
        }
    }

    // === Public Methods ===

    /// Advance all tasks, returns true once the operation is over.
    pub fn tick(&mut self, cx: &mut Context<'_>) -> bool {
        if self.abandoned() {
            debug!(tasks = self.tasks.len(), "Operation cancelled by its caller");

            for task in self.tasks.iter_mut() {
                if let Task::Lookup { query, .. } = task {
                    query.cancel();
                }
            }

            self.tasks.clear();
            self.finish(false);
            return true;
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!(tasks = self.tasks.len(), "Operation timed out");

                self.tasks.clear();
                self.finish(true);
                return true;
            }
        }

        let tasks = std::mem::take(&mut self.tasks);
        let mut running = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            let done = task.tick(cx.transport);
            drain_events(&mut self.kind, &mut self.listener, &mut task);

            if done {
                self.on_task_done(cx, task);
            } else {
                running.push(task);
            }
        }

        // Tasks started by finished ones are ticked next time.
        running.append(&mut self.tasks);
        self.tasks = running;

        if self.satisfied() {
            self.tasks.clear();
        }

        if self.tasks.is_empty() {
            self.finish(false);
            return true;
        }

        false
    }

    /// Returns true if the reply belonged to this operation.
    pub fn on_reply(&mut self, transaction_id: u32, from: &Contact, reply: &Reply) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.inflight(transaction_id)) else {
            return false;
        };

        match task {
            Task::Lookup { query, .. } => query.on_reply(transaction_id, from, reply),
            Task::FanOut(fan_out) => fan_out.on_reply(transaction_id, from, reply),
        }

        drain_events(&mut self.kind, &mut self.listener, task);

        true
    }

    /// Returns true if the timed out request belonged to this operation.
    pub fn on_timeout(&mut self, cx: &mut Context<'_>, transaction_id: u32) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.inflight(transaction_id)) else {
            return false;
        };

        match task {
            Task::Lookup { query, .. } => {
                query.on_timeout(transaction_id);
            }
            Task::FanOut(fan_out) => {
                if let Some(contact) = fan_out.on_timeout(transaction_id) {
                    cx.punches.push(contact);
                }
            }
        }

        true
    }

    pub fn on_punch(&mut self, id: &Id, success: bool) {
        for task in self.tasks.iter_mut() {
            if let Task::FanOut(fan_out) = task {
                fan_out.on_punch(id, success);
            }
        }
    }

    // === Private Methods ===

    /// The caller dropped the receiving end of a get or lookup.
    fn abandoned(&self) -> bool {
        match &self.kind {
            Kind::Get(state) => state.sender.is_disconnected(),
            Kind::Lookup {
                sender: Some(sender),
                ..
            } => sender.is_disconnected(),
            _ => false,
        }
    }

    /// Keys to continue with after `key` was redirected to `keys`.
    fn follow(&mut self, key: Id, keys: Vec<Id>) -> Result<Vec<Id>, PutError> {
        if keys.is_empty() {
            self.listener.diversified(&key, &keys);
            return Err(PutError::OverDiversified);
        }

        if keys.len() != 1 || keys[0] != key {
            debug!(?key, ?keys, "Following diversification");

            if !self.listener.diversified(&key, &keys) {
                return Err(PutError::Cancelled);
            }
        }

        let tried = match &mut self.kind {
            Kind::Put(state) => &mut state.tried,
            Kind::Get(state) => &mut state.tried,
            Kind::Remove(state) => &mut state.tried,
            Kind::Lookup { .. } | Kind::Cache { .. } => return Ok(keys),
        };

        Ok(keys.into_iter().filter(|k| tried.insert(*k)).collect())
    }

    fn fail(&mut self, error: PutError) {
        if let Kind::Put(state) = &mut self.kind {
            state.failure.get_or_insert(error);
        }
    }

    fn start_lookup(&mut self, cx: &mut Context<'_>, key: Id) {
        let query = match &self.kind {
            Kind::Get(state) => {
                if state.flags.contains(ValueFlags::OBFUSCATE_LOOKUP) {
                    cx.find_node(obfuscated_target(&key))
                } else {
                    cx.find_value(key, state.flags, state.max_values, state.exhaustive)
                }
            }
            _ => cx.find_node(key),
        };

        self.tasks.push(Task::Lookup { key, query });
    }

    fn on_task_done(&mut self, cx: &mut Context<'_>, task: Task) {
        match task {
            Task::Lookup { key, query } => {
                cx.cache_lookup(&query);

                if !query.is_cancelled() {
                    for (index, contact) in query.responders().contacts().iter().enumerate() {
                        self.listener.found(contact, index < cx.config.k);
                    }
                }

                self.on_lookup_done(cx, key, query)
            }
            Task::FanOut(fan_out) => self.on_fan_out_done(cx, fan_out),
        }
    }

    fn on_lookup_done(&mut self, cx: &mut Context<'_>, key: Id, query: IterativeQuery) {
        let search_concurrency = cx.config.search_concurrency;

        match &mut self.kind {
            Kind::Lookup {
                sender,
                integration,
            } => {
                if *integration {
                    *cx.integration_done = true;
                }

                if let Some(sender) = sender.take() {
                    let _ = sender.send(query.closest());
                }
            }
            Kind::Put(state) => {
                let mut closest = query.closest();
                closest.truncate(state.replicas);

                if closest.is_empty() {
                    debug!(?key, "No closest nodes to store at");
                    return;
                }

                state.targeted += closest.len();

                let values = state
                    .values
                    .iter()
                    .map(|value| {
                        let mut value = value.clone();
                        value.key = key;
                        value
                    })
                    .collect();

                let tokens = tokens_of(&query, &closest);

                self.tasks.push(Task::FanOut(
                    FanOut::new(key, FanOutRequest::Store(values), closest, search_concurrency)
                        .with_tokens(tokens),
                ));

                self.maybe_answer_put_and_forget();
            }
            Kind::Get(state) => {
                if !query.is_value_search() {
                    // Obfuscated lookup done, ask the closest to the real key directly.
                    let mut closest = ClosestContacts::new(key);
                    for contact in query.responders().contacts() {
                        closest.add(contact.clone());
                    }
                    closest.truncate(search_concurrency);

                    if !closest.is_empty() {
                        self.tasks.push(Task::FanOut(FanOut::new(
                            key,
                            FanOutRequest::FindValue {
                                flags: state.flags,
                                max_values: state.max_values.min(u16::MAX as usize) as u16,
                            },
                            closest.into_vec(),
                            search_concurrency,
                        )));
                    }

                    return;
                }

                if let Some((cause, kind)) = query.diversification() {
                    let keys = cx.adapter.create_new_diversification(
                        &key,
                        Some(cause),
                        false,
                        *kind,
                        state.exhaustive,
                        cx.config.max_diversification_depth,
                    );

                    if let Ok(keys) = self.follow(key, keys) {
                        for key in keys {
                            self.start_lookup(cx, key);
                        }
                    }

                    return;
                }

                cache_at_closest_nodes(cx, state, key, &query);
            }
            Kind::Remove(_) => {
                let closest = query.closest();

                if closest.is_empty() {
                    return;
                }

                let tokens = tokens_of(&query, &closest);

                self.tasks.push(Task::FanOut(
                    FanOut::new(key, FanOutRequest::Remove, closest, search_concurrency)
                        .with_tokens(tokens),
                ));
            }
            Kind::Cache { .. } => {}
        }
    }

    fn on_fan_out_done(&mut self, cx: &mut Context<'_>, fan_out: FanOut) {
        match &mut self.kind {
            Kind::Put(state) => {
                state.stored_at += fan_out.acknowledged().len();
                state.timeouts += fan_out.timeouts();
                state.targeted = state.targeted.saturating_sub(fan_out.redirected());

                if let Some(error) = fan_out.most_common_error() {
                    state.most_common_error.get_or_insert(error);
                }

                let Some((cause, kind)) = fan_out.diversification().cloned() else {
                    return;
                };

                let keys = cx.adapter.create_new_diversification(
                    fan_out.key(),
                    Some(&cause),
                    true,
                    kind,
                    false,
                    cx.config.max_diversification_depth,
                );

                match self.follow(*fan_out.key(), keys) {
                    Ok(keys) => {
                        for key in keys {
                            self.start_lookup(cx, key);
                        }
                    }
                    Err(PutError::OverDiversified) => {
                        if let Kind::Put(state) = &mut self.kind {
                            state.over_diversified = true;
                        }
                    }
                    Err(error) => self.fail(error),
                }
            }
            Kind::Remove(state) => {
                state.acknowledged += fan_out.acknowledged().len();

                debug!(
                    key = ?state.key,
                    acknowledged = fan_out.acknowledged().len(),
                    removed = fan_out.removed(),
                    "Remove fan out done"
                );
            }
            Kind::Cache { key } => {
                debug!(?key, stored_at = fan_out.acknowledged().len(), "Cached values");
            }
            Kind::Lookup { .. } | Kind::Get(_) => {}
        }
    }

    /// Answer a put and forget once all its stores are sent.
    fn maybe_answer_put_and_forget(&mut self) {
        let lookups_left = self
            .tasks
            .iter()
            .any(|task| matches!(task, Task::Lookup { .. }));

        if let Kind::Put(state) = &mut self.kind {
            if state.put_and_forget && !lookups_left && state.targeted > 0 {
                if let Some(sender) = state.sender.take() {
                    let _ = sender.send(Ok(state.key));
                }
            }
        }
    }

    /// A get that collected enough values stops early.
    fn satisfied(&self) -> bool {
        match &self.kind {
            Kind::Get(state) => state.max_values > 0 && state.seen.len() >= state.max_values,
            _ => false,
        }
    }

    fn finish(&mut self, timed_out: bool) {
        let mut timed_out = timed_out;

        match &mut self.kind {
            Kind::Put(state) => {
                let result = put_result(state);

                match &result {
                    Ok(_) => debug!(key = ?state.key, stored_at = state.stored_at, "Put done"),
                    Err(PutError::Timeout) => timed_out = true,
                    Err(error) => {
                        debug!(key = ?state.key, ?error, stored_at = state.stored_at, "Put failed")
                    }
                }

                if let Some(sender) = state.sender.take() {
                    let _ = sender.send(result);
                }
            }
            Kind::Get(state) => {
                debug!(key = ?state.key, values = state.seen.len(), timed_out, "Get done");
            }
            Kind::Remove(state) => {
                info!(key = ?state.key, acknowledged = state.acknowledged, "Remove done");

                let _ = state.sender.send(Ok(state.acknowledged));
            }
            Kind::Lookup { .. } | Kind::Cache { .. } => {}
        }

        self.listener.complete(timed_out);
    }
}

fn put_result(state: &PutState) -> Result<Id, PutError> {
    if let Some(error) = &state.failure {
        return Err(error.clone());
    }

    if state.targeted == 0 && state.stored_at == 0 {
        return Err(if state.over_diversified {
            PutError::OverDiversified
        } else if state.most_common_error == Some(ErrorCode::Blocked) {
            PutError::Blocked
        } else {
            PutError::NoClosestNodes
        });
    }

    if state.stored_at == 0 && state.timeouts >= state.targeted {
        return Err(PutError::Timeout);
    }

    let quorum = state.quorum.required(state.targeted);

    if state.stored_at >= quorum {
        Ok(state.key)
    } else {
        Err(PutError::QuorumNotReached {
            stored_at: state.stored_at,
            quorum,
        })
    }
}

/// Tokens the lookup learned for `contacts`.
fn tokens_of(query: &IterativeQuery, contacts: &[Contact]) -> Vec<(Id, Token)> {
    contacts
        .iter()
        .filter_map(|c| query.token(c.id()).map(|token| (*c.id(), token)))
        .collect()
}

/// Store found values at the closest contacts that didn't have them, at most
/// once per cache republish interval for a key.
fn cache_at_closest_nodes(
    cx: &mut Context<'_>,
    state: &GetState,
    key: Id,
    query: &IterativeQuery,
) {
    let n = cx.config.cache_at_closest_n;

    if n == 0 || query.values().is_empty() || state.flags.contains(ValueFlags::STATS) {
        return;
    }

    let now = Instant::now();

    if let Some(last) = cx.cache_rate.get(&key) {
        if now.saturating_duration_since(*last) < cx.config.cache_republish_interval {
            return;
        }
    }

    let contacts: Vec<Contact> = query
        .without_value()
        .contacts()
        .iter()
        .take(n)
        .cloned()
        .collect();

    if contacts.is_empty() {
        return;
    }

    cx.cache_rate.put(key, now);

    let values = query
        .values()
        .iter()
        .map(|value| {
            let mut value = value.clone();
            value.key = key;
            value.local = false;
            value
        })
        .collect();

    cx.spawned.push(Plan::Cache {
        key,
        values,
        tokens: tokens_of(query, &contacts),
        contacts,
    });
}

/// Forward progress of a task to the listener, and found values to the getter.
fn drain_events(kind: &mut Kind, listener: &mut Listener, task: &mut Task) {
    let (found, key): (Vec<(Contact, StoredValue)>, Id) = match task {
        Task::Lookup { key, query } => {
            let mut found = Vec::new();

            for event in query.take_events() {
                match event {
                    QueryEvent::Searching { contacted, active } => {
                        listener.searching(key, contacted, active)
                    }
                    QueryEvent::Read { from, value } => found.push((from, value)),
                }
            }

            (found, *key)
        }
        Task::FanOut(fan_out) => {
            let mut found = Vec::new();
            let key = *fan_out.key();

            for event in fan_out.take_events() {
                match event {
                    FanOutEvent::Wrote { contact } => {
                        let value = match fan_out.request() {
                            FanOutRequest::Store(values) => values.first(),
                            _ => None,
                        };
                        listener.wrote(&contact, value);
                    }
                    FanOutEvent::Read { contact, value } => found.push((contact, value)),
                }
            }

            (found, key)
        }
    };

    deliver_values(kind, listener, key, found);
}

/// Hand values found under `key` to the getter, once per origin and payload.
fn deliver_values(
    kind: &mut Kind,
    listener: &mut Listener,
    key: Id,
    found: Vec<(Contact, StoredValue)>,
) {
    let Kind::Get(state) = kind else {
        return;
    };

    for (from, mut value) in found {
        if state.max_values > 0 && state.seen.len() >= state.max_values {
            break;
        }

        if !state
            .seen
            .insert((*value.origin().id(), value.payload().clone()))
        {
            continue;
        }

        if key != state.key {
            value.key = state.key;
        }

        listener.read(&from, &value);
        let _ = state.sender.send(value);
    }
}
