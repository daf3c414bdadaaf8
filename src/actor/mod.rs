//! Actor implementation - I/O orchestration layer for the DHT.

pub(crate) mod config;
mod handle_request;
mod handle_response;
mod info;
pub(crate) mod listener;
mod operation;

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use lru::LruCache;
use tracing::{debug, error, info, warn};

use crate::adapter::{NatPuncher, PunchOutcome, PunchReporter, StorageAdapter};
use crate::common::{
    Contact, Id, ReplicationControl, Request, RoutingTable, StoredValue, ValueFlags,
    MAX_VALUE_SIZE,
};
use crate::core::republish::RepublishSchedule;
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::core::server::Server;
use crate::core::store::{LocalStore, StoreError};
use crate::error::{BuildError, PutError, RemoveError, SnapshotError};
use crate::snapshot::Snapshot;
use crate::transport::Transport;

use config::Config;
use listener::Listener;
use operation::{Context, Operation, Plan};

pub use info::Info;

/// Closest contacts of this many recent lookup targets are kept to seed later lookups.
const LOOKUP_CACHE_SIZE: usize = 256;
/// Keys whose last closest nodes caching time is remembered.
const CACHE_RATE_SIZE: usize = 1024;
/// Wait for transport events at most this long per tick.
const RECV_TIMEOUT: Duration = Duration::from_millis(1);
/// Events handled per tick after the first one.
const MAX_EVENTS_PER_TICK: usize = 64;

#[derive(Debug, Clone, Copy)]
/// Options of a put.
pub struct PutOptions {
    /// Defaults to [ValueFlags::SINGLE_VALUE]
    pub flags: ValueFlags,
    /// Life of the value in hours, `0` to keep it until removed (republished remotely).
    ///
    /// Defaults to `0`
    pub life_hours: u8,
    /// Defaults to [ReplicationControl::Default]
    pub replication: ReplicationControl,
    /// Queue ahead of low priority operations.
    ///
    /// Use the same priority for every put of a key, operations of different
    /// priorities on the same key may be reordered.
    pub high_priority: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            flags: ValueFlags::SINGLE_VALUE,
            life_hours: 0,
            replication: ReplicationControl::Default,
            high_priority: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Options of a get.
pub struct GetOptions {
    pub flags: ValueFlags,
    /// Stop after this many distinct values, `0` for no bound.
    pub max_values: usize,
    /// Complete with `timed_out` after this long.
    pub timeout: Option<Duration>,
    /// Search all the closest nodes and all derived keys instead of stopping early.
    pub exhaustive: bool,
    pub high_priority: bool,
}

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop, useful to create your own actor setup.
pub struct Actor {
    config: Config,
    transport: Box<dyn Transport>,

    // Routing
    routing_table: RoutingTable,
    maintenance: RoutingMaintenance,
    /// Transaction ids of maintenance pings.
    pings: HashMap<u32, Id>,

    // Storage
    store: LocalStore,
    adapter: Arc<dyn StorageAdapter>,
    server: Server,
    republish: RepublishSchedule,

    // Operations
    operations: Vec<Operation>,
    high_priority: VecDeque<Plan>,
    low_priority: VecDeque<Plan>,
    lookup_cache: LruCache<Id, Vec<Contact>>,
    cache_rate: LruCache<Id, Instant>,

    // NAT punching
    puncher: Box<dyn NatPuncher>,
    punch_sender: Sender<PunchOutcome>,
    punch_receiver: Receiver<PunchOutcome>,

    suspended: bool,
    integrated: bool,
    integrating: bool,
    integration_waiters: Vec<Sender<bool>>,
}

impl Actor {
    /// Creates a new Actor. Does not perform network I/O; call [`Actor::tick`] to
    /// run operations and scheduled maintenance.
    pub fn new(
        config: Config,
        transport: Box<dyn Transport>,
        adapter: Arc<dyn StorageAdapter>,
        puncher: Box<dyn NatPuncher>,
    ) -> Result<Self, BuildError> {
        config.validate()?;

        let id = *transport.local_contact().id();
        let (punch_sender, punch_receiver) = flume::unbounded();

        info!(?id, network = config.network, address = ?transport.local_contact().address(), "Starting Dht node");

        Ok(Actor {
            routing_table: RoutingTable::new(id)
                .with_bucket_size(config.k)
                .with_split_factor(config.split_factor)
                .with_max_replacements(config.max_replacements),
            maintenance: RoutingMaintenance::new(config.random_lookup),
            pings: HashMap::new(),

            store: LocalStore::new(adapter.clone(), config.original_republish_interval),
            adapter,
            server: Server::new(),
            republish: RepublishSchedule::new(config.cache_republish_interval),

            operations: Vec::new(),
            high_priority: VecDeque::new(),
            low_priority: VecDeque::new(),
            lookup_cache: LruCache::new(capacity(LOOKUP_CACHE_SIZE)),
            cache_rate: LruCache::new(capacity(CACHE_RATE_SIZE)),

            puncher,
            punch_sender,
            punch_receiver,

            suspended: false,
            integrated: false,
            integrating: false,
            integration_waiters: Vec::new(),

            transport,
            config,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_contact(&self) -> &Contact {
        self.transport.local_contact()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Returns true once an integration lookup finished with a non empty routing table.
    pub fn is_integrated(&self) -> bool {
        self.integrated
    }

    /// Operations running or waiting for a slot.
    pub fn active_operations(&self) -> usize {
        self.operations.len() + self.high_priority.len() + self.low_priority.len()
    }

    /// Returns true if the storage adapter redirects `key` to derived keys.
    pub fn is_diversified(&self, key: &Id) -> bool {
        self.adapter.is_diversified(key)
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advances operations, maintenance and republishing by one step, then
    /// handles incoming transport events.
    ///
    /// Call periodically; delays degrade query completion and routing table quality.
    pub fn tick(&mut self) {
        self.handle_punch_outcomes();

        if self.suspended {
            return;
        }

        self.expire_queued_operations();
        self.start_queued_operations();
        self.tick_operations();

        self.periodic_node_maintenance();
        self.periodic_republish();

        self.handle_events();
    }

    /// Store a value under `key` locally, then at the closest nodes.
    ///
    /// The result is sent once the put is confirmed, or right after the
    /// stores were sent with [ValueFlags::PUT_AND_FORGET].
    pub fn put(
        &mut self,
        key: Id,
        payload: Bytes,
        options: PutOptions,
        listener: Listener,
        sender: Sender<Result<Id, PutError>>,
    ) {
        if let Err(error) = validate_payload(&payload) {
            let _ = sender.send(Err(error));
            return;
        }

        let version = self.adapter.next_value_versions(1);
        let origin = self.transport.local_contact().clone();

        let value = StoredValue::new(key, payload, origin)
            .with_flags(options.flags.stored())
            .with_version(version)
            .with_life_hours(options.life_hours)
            .with_replication(options.replication)
            .local();

        if let Err(error) = self.store.put(value.clone()) {
            debug!(?key, ?error, "Local store refused put");

            let _ = sender.send(Err(match error {
                StoreError::Blocked => PutError::Blocked,
                StoreError::Rejected | StoreError::Full => PutError::Rejected,
            }));
            return;
        }

        // The store may have bumped the version of an identical value.
        let value = self
            .store
            .local_values()
            .find(|v| v.key() == &key && v.same_payload(&value))
            .cloned()
            .unwrap_or(value);

        self.enqueue(
            Plan::Put {
                key,
                values: vec![value],
                put_and_forget: options.flags.contains(ValueFlags::PUT_AND_FORGET),
                sender: Some(sender),
                listener,
            },
            options.high_priority,
        );
    }

    /// Stream values stored under `key` to `sender`, until the channel is
    /// dropped by the actor once the get completes.
    pub fn get(
        &mut self,
        key: Id,
        options: GetOptions,
        listener: Listener,
        sender: Sender<StoredValue>,
    ) {
        self.enqueue(
            Plan::Get {
                key,
                flags: options.flags,
                max_values: options.max_values,
                deadline: options.timeout.map(|timeout| Instant::now() + timeout),
                exhaustive: options.exhaustive,
                sender,
                listener,
            },
            options.high_priority,
        );
    }

    /// Remove our values of `key`, locally and from `contacts` or the closest nodes.
    ///
    /// Sends the number of remote nodes that acknowledged the removal.
    pub fn remove(
        &mut self,
        key: Id,
        contacts: Option<Vec<Contact>>,
        listener: Listener,
        sender: Sender<Result<usize, RemoveError>>,
    ) {
        let id = *self.id();
        let removed = self.store.remove(&key, Some(&id));

        debug!(?key, removed, "Removed local values");

        self.enqueue(
            Plan::Remove {
                key,
                contacts,
                sender,
                listener,
            },
            true,
        );
    }

    /// Find the closest nodes to `target`.
    pub fn lookup(&mut self, target: Id, sender: Sender<Vec<Contact>>) {
        self.enqueue(
            Plan::Lookup {
                target,
                sender: Some(sender),
                integration: false,
            },
            true,
        );
    }

    /// Bootstrap the routing table with a lookup of our own Id.
    ///
    /// With `full_wait` the sender gets whether the routing table was
    /// populated once the lookup is done, otherwise the current state right away.
    /// Calling it while an integration is running only waits for that one.
    pub fn integrate(&mut self, full_wait: bool, sender: Sender<bool>) {
        if !self.integrating {
            self.integrating = true;

            let target = *self.id();
            self.enqueue(
                Plan::Lookup {
                    target,
                    sender: None,
                    integration: true,
                },
                true,
            );
        }

        if full_wait {
            self.integration_waiters.push(sender);
        } else {
            let _ = sender.send(self.integrated);
        }
    }

    /// Pause or resume all network activity.
    pub fn set_suspended(&mut self, suspended: bool) {
        if self.suspended == suspended {
            return;
        }

        info!(?suspended, id = ?self.id(), "Setting suspended");

        self.suspended = suspended;
        self.transport.set_suspended(suspended);
    }

    /// Capture up to `max` contacts, most recently seen first, and optionally our own values.
    pub fn export(&self, max: usize, include_values: bool) -> Snapshot {
        Snapshot::capture(
            &self.routing_table,
            &self.store,
            self.config.network,
            max,
            include_values,
        )
    }

    /// Merge a snapshot into the routing table and store, returns the number of contacts added.
    pub fn import(&mut self, snapshot: &Snapshot) -> Result<usize, SnapshotError> {
        let origin = self.transport.local_contact().clone();
        let added = snapshot.restore(
            &mut self.routing_table,
            &mut self.store,
            &origin,
            self.config.network,
        )?;

        info!(added, table_size = self.routing_table.size(), "Imported snapshot");

        Ok(added)
    }

    // === Private Methods ===

    fn enqueue(&mut self, plan: Plan, high_priority: bool) {
        if high_priority {
            self.high_priority.push_back(plan);
        } else {
            self.low_priority.push_back(plan);
        }
    }

    /// Complete queued gets that ran out of time waiting for a slot.
    fn expire_queued_operations(&mut self) {
        let now = Instant::now();

        for queue in [&mut self.high_priority, &mut self.low_priority] {
            if queue.is_empty() {
                continue;
            }

            *queue = std::mem::take(queue)
                .into_iter()
                .filter_map(|plan| plan.expire(now))
                .collect();
        }
    }

    fn start_queued_operations(&mut self) {
        while self.operations.len() < self.config.max_concurrent_operations {
            let Some(plan) = self
                .high_priority
                .pop_front()
                .or_else(|| self.low_priority.pop_front())
            else {
                break;
            };

            let mut spawned = Vec::new();
            let mut punches = Vec::new();
            let mut integration_done = false;

            let operation = {
                let mut cx = self.context(&mut spawned, &mut punches, &mut integration_done);
                Operation::start(plan, &mut cx)
            };

            self.operations.push(operation);
            self.after_context(spawned, punches, integration_done);
        }
    }

    fn tick_operations(&mut self) {
        let mut spawned = Vec::new();
        let mut punches = Vec::new();
        let mut integration_done = false;

        let mut operations = std::mem::take(&mut self.operations);

        {
            let mut cx = self.context(&mut spawned, &mut punches, &mut integration_done);
            operations.retain_mut(|operation| !operation.tick(&mut cx));
        }

        self.operations = operations;
        self.after_context(spawned, punches, integration_done);
    }

    fn context<'a>(
        &'a mut self,
        spawned: &'a mut Vec<Plan>,
        punches: &'a mut Vec<Contact>,
        integration_done: &'a mut bool,
    ) -> Context<'a> {
        Context {
            config: &self.config,
            transport: self.transport.as_mut(),
            routing_table: &mut self.routing_table,
            store: &self.store,
            adapter: &self.adapter,
            lookup_cache: &mut self.lookup_cache,
            cache_rate: &mut self.cache_rate,
            spawned,
            punches,
            integration_done,
        }
    }

    /// Apply the side effects operations asked for.
    fn after_context(&mut self, spawned: Vec<Plan>, punches: Vec<Contact>, integration_done: bool) {
        for plan in spawned {
            self.enqueue(plan, false);
        }

        for contact in punches {
            debug!(contact = ?contact.id(), "Punching contact");

            let reporter = PunchReporter::new(*contact.id(), self.punch_sender.clone());
            self.puncher.punch(&contact, reporter);
        }

        if integration_done {
            self.integrating = false;
            self.integrated = !self.routing_table.is_empty();

            self.log_bootstrap();

            for waiter in self.integration_waiters.drain(..) {
                let _ = waiter.send(self.integrated);
            }
        }
    }

    fn handle_punch_outcomes(&mut self) {
        while let Ok(PunchOutcome { contact, success }) = self.punch_receiver.try_recv() {
            for operation in self.operations.iter_mut() {
                operation.on_punch(&contact, success);
            }
        }
    }

    /// Run periodic routing-table maintenance (purge, ping, populate, refresh).
    fn periodic_node_maintenance(&mut self) {
        let decisions = self
            .maintenance
            .periodic_maintenance_decisions(&mut self.routing_table);

        if decisions.should_purge {
            let purged = self.routing_table.purge_dead_replacements();

            if purged > 0 {
                debug!(purged, "Purged dead replacements");
            }
        }

        for contact in decisions.contacts_to_ping {
            let transaction_id = self.transport.request(contact.address(), Request::Ping);
            self.pings.insert(transaction_id, *contact.id());
        }

        if decisions.should_populate && !self.config.bootstrap.is_empty() {
            let (sender, _) = flume::bounded(1);
            self.integrate(false, sender);
        }

        for target in decisions.refresh_targets {
            self.enqueue(
                Plan::Lookup {
                    target,
                    sender: None,
                    integration: false,
                },
                false,
            );
        }
    }

    /// Sweep expired values, and republish due ones.
    fn periodic_republish(&mut self) {
        let decisions = self.republish.decisions(&mut self.store);

        if decisions.is_empty() {
            return;
        }

        debug!(
            expired = decisions.expired,
            originals = decisions.originals.len(),
            cached = decisions.cached.len(),
            "Republishing"
        );

        for (key, values) in decisions.originals.into_iter().chain(decisions.cached) {
            self.enqueue(
                Plan::Put {
                    key,
                    values,
                    put_and_forget: false,
                    sender: None,
                    listener: Listener::none(),
                },
                false,
            );
        }
    }

    /// Handle a batch of transport events.
    fn handle_events(&mut self) {
        let mut timeout = RECV_TIMEOUT;

        for _ in 0..=MAX_EVENTS_PER_TICK {
            let Some(event) = self.transport.recv(timeout) else {
                break;
            };

            self.handle_event(event);
            timeout = Duration::ZERO;
        }
    }

    /// Check if routing table is empty and log an error if so.
    fn log_bootstrap(&self) {
        let table_size = self.routing_table.size();

        if table_size == 0 {
            if self.config.bootstrap.is_empty() {
                warn!("No bootstrap nodes, waiting for other nodes to contact us");
            } else {
                error!("Could not bootstrap the routing table");
            }
        } else {
            debug!(id = ?self.id(), table_size, "Populated the routing table");
        }
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Reject payloads no node would store.
pub(crate) fn validate_payload(payload: &[u8]) -> Result<(), PutError> {
    if payload.is_empty() {
        return Err(PutError::EmptyValue);
    }

    if payload.len() > MAX_VALUE_SIZE {
        return Err(PutError::ValueTooLarge(payload.len()));
    }

    Ok(())
}
