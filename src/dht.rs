//! Dht node.

use std::{
    io::{Read, Write},
    net::SocketAddr,
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::{
    actor::{
        config::{Config, Quorum},
        listener::{Listener, OperationListener},
        validate_payload, Actor, GetOptions, Info, PutOptions,
    },
    adapter::{MemoryStorageAdapter, NatPuncher, NoopNatPuncher, StorageAdapter},
    common::{Contact, ContactFlags, Id, StoredValue},
    error::{
        BuildError, DhtGetError, DhtPutError, DhtRemoveError, DhtWasShutdown, GetError, PutError,
        RemoveError, SnapshotError,
    },
    snapshot::Snapshot,
    transport::{MemoryNetwork, Transport},
};

/// How long the actor thread sleeps between ticks while suspended.
const SUSPENDED_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
/// Dht node handle, cheap to clone.
///
/// All the node's state lives in an actor thread, which stops once every
/// handle is dropped or [Dht::destroy] is called.
pub struct Dht {
    pub(crate) sender: Sender<ActorMessage>,
    pub(crate) encode_keys: bool,
}

#[derive(Debug, Default)]
/// A builder for the [Dht] node.
pub struct DhtBuilder {
    config: Config,
    id: Option<Id>,
    adapter: Option<Arc<dyn StorageAdapter>>,
    puncher: Option<Box<dyn NatPuncher>>,
    transport: Option<Box<dyn Transport>>,
    memory_network: Option<MemoryNetwork>,
    contact_flags: ContactFlags,
}

impl DhtBuilder {
    /// Id of the logical network, nodes of different networks never talk.
    pub fn network(mut self, network: u8) -> Self {
        self.config.network = network;
        self
    }

    /// Set bootstrapping nodes.
    pub fn bootstrap(mut self, bootstrap: &[SocketAddr]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Contacts per bucket, also the number of closest nodes of a lookup.
    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;
        self
    }

    pub fn split_factor(mut self, split_factor: usize) -> Self {
        self.config.split_factor = split_factor;
        self
    }

    pub fn search_concurrency(mut self, search_concurrency: usize) -> Self {
        self.config.search_concurrency = search_concurrency;
        self
    }

    pub fn lookup_concurrency(mut self, lookup_concurrency: usize) -> Self {
        self.config.lookup_concurrency = lookup_concurrency;
        self
    }

    pub fn max_replacements(mut self, max_replacements: usize) -> Self {
        self.config.max_replacements = max_replacements;
        self
    }

    /// Number of closest nodes without a value that a get caches it at, `0` to disable.
    pub fn cache_at_closest_n(mut self, cache_at_closest_n: usize) -> Self {
        self.config.cache_at_closest_n = cache_at_closest_n;
        self
    }

    pub fn original_republish_interval(mut self, interval: Duration) -> Self {
        self.config.original_republish_interval = interval;
        self
    }

    pub fn cache_republish_interval(mut self, interval: Duration) -> Self {
        self.config.cache_republish_interval = interval;
        self
    }

    /// Hash keys with SHA-1, otherwise keys must be 20 bytes.
    pub fn encode_keys(mut self, encode_keys: bool) -> Self {
        self.config.encode_keys = encode_keys;
        self
    }

    pub fn random_lookup(mut self, random_lookup: bool) -> Self {
        self.config.random_lookup = random_lookup;
        self
    }

    pub fn put_quorum(mut self, quorum: Quorum) -> Self {
        self.config.put_quorum = quorum;
        self
    }

    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.config.max_concurrent_operations = max;
        self
    }

    pub fn max_diversification_depth(mut self, depth: u8) -> Self {
        self.config.max_diversification_depth = depth;
        self
    }

    /// Request timeout of the [MemoryNetwork] transport.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Id of a node bound to a [MemoryNetwork], random by default.
    pub fn id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Defaults to a [MemoryStorageAdapter].
    pub fn storage_adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Defaults to [NoopNatPuncher].
    pub fn nat_puncher(mut self, puncher: Box<dyn NatPuncher>) -> Self {
        self.puncher = Some(puncher);
        self
    }

    /// Advertise that this node accepts NAT punching, on a [MemoryNetwork].
    pub fn accepts_nat_punch(mut self, accepts_nat_punch: bool) -> Self {
        self.contact_flags.accepts_nat_punch = accepts_nat_punch;
        self
    }

    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Bind to a process local network.
    pub fn memory_network(mut self, network: &MemoryNetwork) -> Self {
        self.memory_network = Some(network.clone());
        self
    }

    /// Join a [Testnet]: its memory network, network id and bootstrap node.
    pub fn testnet(self, testnet: &Testnet) -> Self {
        self.memory_network(&testnet.memory_network)
            .network(testnet.network_id)
            .bootstrap(&testnet.bootstrap)
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht, BuildError> {
        let transport: Box<dyn Transport> = match (self.transport, self.memory_network) {
            (Some(transport), _) => transport,
            (None, Some(network)) => Box::new(
                network
                    .bind(
                        self.id.unwrap_or_else(Id::random),
                        self.config.network,
                        self.config.request_timeout,
                    )
                    .with_flags(self.contact_flags),
            ),
            (None, None) => return Err(BuildError::MissingTransport),
        };

        let adapter = self
            .adapter
            .unwrap_or_else(|| Arc::new(MemoryStorageAdapter::new()));
        let puncher = self.puncher.unwrap_or_else(|| Box::new(NoopNatPuncher));

        Dht::new(self.config, transport, adapter, puncher)
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node running in its own thread.
    pub fn new(
        config: Config,
        transport: Box<dyn Transport>,
        adapter: Arc<dyn StorageAdapter>,
        puncher: Box<dyn NatPuncher>,
    ) -> Result<Self, BuildError> {
        let (sender, receiver) = flume::unbounded();

        let encode_keys = config.encode_keys;
        let name = format!("distdb-{}", config.network);

        let actor = Actor::new(config, transport, adapter, puncher)?;

        thread::Builder::new()
            .name(name)
            .spawn(move || run(actor, receiver))?;

        Ok(Dht {
            sender,
            encode_keys,
        })
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Returns true if the storage adapter redirects `key` to derived keys.
    pub fn is_diversified(&self, key: &[u8]) -> Result<bool, DhtGetError> {
        let key = encode_key(key, self.encode_keys).ok_or(GetError::MalformedKey)?;
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::IsDiversified(key, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)?)
    }

    // === Public Methods ===

    /// Bootstrap the routing table, from the bootstrap nodes or imported contacts.
    ///
    /// With `full_wait` blocks until the self lookup is done. Returns whether
    /// the routing table is populated.
    pub fn integrate(&self, full_wait: bool) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::Integrate(full_wait, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Pause or resume all network activity, keeping all state.
    pub fn set_suspended(&self, suspended: bool) -> Result<(), DhtWasShutdown> {
        self.send(ActorMessage::SetSuspended(suspended))
    }

    /// Stop the actor thread and wait for it to release the node.
    ///
    /// Every clone of this handle fails with [DhtWasShutdown] afterwards.
    pub fn destroy(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    // === Find nodes ===

    /// Closest responding nodes to `target`.
    pub fn lookup(&self, target: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Contact>>(1);

        self.send(ActorMessage::Lookup(target, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Values ===

    /// Store a value, returns the key's [Id] once a quorum of replicas confirmed it.
    pub fn put(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        options: PutOptions,
    ) -> Result<Id, DhtPutError> {
        self.put_with_listener(key, value, options, ())
    }

    pub fn put_with_listener(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        options: PutOptions,
        listener: impl OperationListener + 'static,
    ) -> Result<Id, DhtPutError> {
        let receiver = self.start_put(key, value.into(), options, Listener::new(Box::new(listener)))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Values stored under `key`, as they arrive.
    pub fn get(&self, key: &[u8], options: GetOptions) -> Result<GetResponse, DhtGetError> {
        self.get_with_listener(key, options, ())
    }

    pub fn get_with_listener(
        &self,
        key: &[u8],
        options: GetOptions,
        listener: impl OperationListener + 'static,
    ) -> Result<GetResponse, DhtGetError> {
        let receiver = self.start_get(key, options, Listener::new(Box::new(listener)))?;

        Ok(GetResponse { receiver })
    }

    /// Remove our values of `key` locally and from the closest nodes.
    ///
    /// Removal is best effort, returns the number of nodes that acknowledged it.
    pub fn remove(&self, key: &[u8]) -> Result<usize, DhtRemoveError> {
        self.remove_with_listener(key, None, ())
    }

    /// Remove our values of `key` from explicit `contacts` instead of the closest nodes.
    pub fn remove_from(&self, key: &[u8], contacts: Vec<Contact>) -> Result<usize, DhtRemoveError> {
        self.remove_with_listener(key, Some(contacts), ())
    }

    pub fn remove_with_listener(
        &self,
        key: &[u8],
        contacts: Option<Vec<Contact>>,
        listener: impl OperationListener + 'static,
    ) -> Result<usize, DhtRemoveError> {
        let receiver = self.start_remove(key, contacts, Listener::new(Box::new(listener)))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    // === Snapshots ===

    /// Capture up to `max` contacts, and optionally our own values.
    pub fn export(&self, max: usize, include_values: bool) -> Result<Snapshot, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Snapshot>(1);

        self.send(ActorMessage::Export {
            max,
            include_values,
            sender,
        })?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Write a snapshot of up to `max` contacts and our own values.
    pub fn export_state<W: Write>(&self, writer: W, max: usize) -> Result<(), SnapshotError> {
        self.export(max, true)?.write_to(writer)
    }

    /// Merge a snapshot, returns the number of contacts added to the routing table.
    ///
    /// Call [Dht::integrate] afterwards to refresh the imported contacts.
    pub fn import(&self, snapshot: Snapshot) -> Result<usize, SnapshotError> {
        let (sender, receiver) = flume::bounded::<Result<usize, SnapshotError>>(1);

        self.send(ActorMessage::Import(Box::new(snapshot), sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)?
    }

    pub fn import_state<R: Read>(&self, reader: R) -> Result<usize, SnapshotError> {
        self.import(Snapshot::read_from(reader)?)
    }

    // === Private Methods ===

    pub(crate) fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.sender.send(message).map_err(|_| DhtWasShutdown)
    }

    pub(crate) fn start_put(
        &self,
        key: &[u8],
        value: Bytes,
        options: PutOptions,
        listener: Listener,
    ) -> Result<Receiver<Result<Id, PutError>>, DhtPutError> {
        let key = encode_key(key, self.encode_keys).ok_or(PutError::MalformedKey)?;
        validate_payload(&value)?;

        let (sender, receiver) = flume::bounded::<Result<Id, PutError>>(1);

        self.send(ActorMessage::Put {
            key,
            value,
            options,
            listener,
            sender,
        })?;

        Ok(receiver)
    }

    pub(crate) fn start_get(
        &self,
        key: &[u8],
        options: GetOptions,
        listener: Listener,
    ) -> Result<Receiver<StoredValue>, DhtGetError> {
        let key = encode_key(key, self.encode_keys).ok_or(GetError::MalformedKey)?;

        // Get requests use unbounded channels to avoid blocking in the run loop.
        let (sender, receiver) = flume::unbounded::<StoredValue>();

        self.send(ActorMessage::Get {
            key,
            options,
            listener,
            sender,
        })?;

        Ok(receiver)
    }

    pub(crate) fn start_remove(
        &self,
        key: &[u8],
        contacts: Option<Vec<Contact>>,
        listener: Listener,
    ) -> Result<Receiver<Result<usize, RemoveError>>, DhtRemoveError> {
        let key = encode_key(key, self.encode_keys).ok_or(RemoveError::MalformedKey)?;
        let (sender, receiver) = flume::bounded::<Result<usize, RemoveError>>(1);

        self.send(ActorMessage::Remove {
            key,
            contacts,
            listener,
            sender,
        })?;

        Ok(receiver)
    }
}

/// Map a user key to an [Id], `None` if it is malformed.
pub(crate) fn encode_key(key: &[u8], encode: bool) -> Option<Id> {
    if key.is_empty() {
        return None;
    }

    if encode {
        Some(Id::encode_key(key))
    } else {
        Id::from_bytes(key).ok()
    }
}

fn run(mut actor: Actor, receiver: Receiver<ActorMessage>) {
    loop {
        loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => {
                    info!(id = ?actor.id(), "Shutting down Dht node");

                    drop(actor);
                    let _ = sender.send(());
                    return;
                }
                Ok(message) => handle_message(&mut actor, message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!(id = ?actor.id(), "Every Dht handle was dropped");
                    return;
                }
            }
        }

        actor.tick();

        if actor.is_suspended() {
            thread::sleep(SUSPENDED_TICK);
        }
    }
}

fn handle_message(actor: &mut Actor, message: ActorMessage) {
    match message {
        ActorMessage::Info(sender) => {
            let _ = sender.send(actor.info());
        }
        ActorMessage::Put {
            key,
            value,
            options,
            listener,
            sender,
        } => actor.put(key, value, options, listener, sender),
        ActorMessage::Get {
            key,
            options,
            listener,
            sender,
        } => actor.get(key, options, listener, sender),
        ActorMessage::Remove {
            key,
            contacts,
            listener,
            sender,
        } => actor.remove(key, contacts, listener, sender),
        ActorMessage::Lookup(target, sender) => actor.lookup(target, sender),
        ActorMessage::Integrate(full_wait, sender) => actor.integrate(full_wait, sender),
        ActorMessage::SetSuspended(suspended) => actor.set_suspended(suspended),
        ActorMessage::IsDiversified(key, sender) => {
            let _ = sender.send(actor.is_diversified(&key));
        }
        ActorMessage::Export {
            max,
            include_values,
            sender,
        } => {
            let _ = sender.send(actor.export(max, include_values));
        }
        ActorMessage::Import(snapshot, sender) => {
            let _ = sender.send(actor.import(&snapshot));
        }
        ActorMessage::Shutdown(_) => {}
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Put {
        key: Id,
        value: Bytes,
        options: PutOptions,
        listener: Listener,
        sender: Sender<Result<Id, PutError>>,
    },
    Get {
        key: Id,
        options: GetOptions,
        listener: Listener,
        sender: Sender<StoredValue>,
    },
    Remove {
        key: Id,
        contacts: Option<Vec<Contact>>,
        listener: Listener,
        sender: Sender<Result<usize, RemoveError>>,
    },
    Lookup(Id, Sender<Vec<Contact>>),
    Integrate(bool, Sender<bool>),
    SetSuspended(bool),
    IsDiversified(Id, Sender<bool>),
    Export {
        max: usize,
        include_values: bool,
        sender: Sender<Snapshot>,
    },
    Import(Box<Snapshot>, Sender<Result<usize, SnapshotError>>),
    Shutdown(Sender<()>),
}

#[derive(Debug)]
/// Values of a get, in the order they were found.
///
/// Iteration ends once the get completes. Dropping it cancels the get.
pub struct GetResponse {
    receiver: Receiver<StoredValue>,
}

impl GetResponse {
    /// Stop the get before its next lookup round.
    pub fn cancel(self) {
        drop(self.receiver)
    }
}

impl Iterator for GetResponse {
    type Item = StoredValue;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[derive(Debug)]
/// Create a testnet of Dht nodes to run tests against instead of the real network.
pub struct Testnet {
    pub bootstrap: Vec<SocketAddr>,
    pub nodes: Vec<Dht>,
    memory_network: MemoryNetwork,
    network_id: u8,
}

impl Testnet {
    /// Boot `count` nodes on a fresh [MemoryNetwork].
    pub fn new(count: usize) -> Result<Testnet, BuildError> {
        Self::with_network(&MemoryNetwork::new(), 0, count)
    }

    /// Boot `count` nodes of logical network `network_id` on a shared [MemoryNetwork].
    pub fn with_network(
        memory_network: &MemoryNetwork,
        network_id: u8,
        count: usize,
    ) -> Result<Testnet, BuildError> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            let builder = Dht::builder()
                .memory_network(memory_network)
                .network(network_id)
                .bootstrap(&bootstrap);

            let node = builder.build()?;

            if i == 0 {
                let info = node.info().map_err(std::io::Error::other)?;
                bootstrap.push(info.local_addr());
            }

            nodes.push(node);
        }

        for _ in 0..2 {
            for node in &nodes {
                let _ = node.integrate(true);
            }
        }

        Ok(Testnet {
            bootstrap,
            nodes,
            memory_network: memory_network.clone(),
            network_id,
        })
    }

    pub fn memory_network(&self) -> &MemoryNetwork {
        &self.memory_network
    }

    pub fn network_id(&self) -> u8 {
        self.network_id
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::actor::listener::{ChannelListener, OperationEvent};
    use crate::common::ValueFlags;

    #[test]
    fn shutdown() {
        let network = MemoryNetwork::new();
        let dht = Dht::builder().memory_network(&network).build().unwrap();

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.destroy();
        })
        .join()
        .unwrap();

        assert!(matches!(dht.info(), Err(DhtWasShutdown)));
        assert!(network.is_empty());
    }

    #[test]
    fn missing_transport() {
        assert!(matches!(
            Dht::builder().build(),
            Err(BuildError::MissingTransport)
        ));
    }

    #[test]
    fn malformed_keys() {
        let network = MemoryNetwork::new();
        let dht = Dht::builder()
            .memory_network(&network)
            .encode_keys(false)
            .build()
            .unwrap();

        assert!(matches!(
            dht.put(b"short", "v", PutOptions::default()),
            Err(DhtPutError::PutError(PutError::MalformedKey))
        ));
        assert!(matches!(
            dht.get(b"", GetOptions::default()),
            Err(DhtGetError::GetError(GetError::MalformedKey))
        ));
        assert!(matches!(
            dht.remove(&[0; 21]),
            Err(DhtRemoveError::RemoveError(RemoveError::MalformedKey))
        ));
    }

    #[test]
    fn bootstrap() {
        let testnet = Testnet::new(10).unwrap();

        let dht = Dht::builder().testnet(&testnet).build().unwrap();

        assert!(dht.integrate(true).unwrap());

        let info = dht.info().unwrap();
        assert!(info.integrated());
        assert!(info.routing_table_size() >= 9);
    }

    #[test]
    fn put_get() {
        let testnet = Testnet::new(10).unwrap();

        let a = Dht::builder().testnet(&testnet).build().unwrap();
        let b = Dht::builder().testnet(&testnet).build().unwrap();
        a.integrate(true).unwrap();
        b.integrate(true).unwrap();

        let options = PutOptions {
            life_hours: 8,
            ..Default::default()
        };
        let id = a.put(b"K1", "V1", options).unwrap();
        assert_eq!(id, Id::encode_key(b"K1"));

        let values: Vec<StoredValue> = b.get(b"K1", GetOptions::default()).unwrap().collect();

        assert!(!values.is_empty());
        assert_eq!(values[0].payload(), &Bytes::from_static(b"V1"));
        assert_eq!(values[0].key(), &id);
    }

    #[test]
    fn put_and_forget() {
        let testnet = Testnet::new(5).unwrap();
        let a = Dht::builder().testnet(&testnet).build().unwrap();
        a.integrate(true).unwrap();

        let options = PutOptions {
            flags: ValueFlags::PUT_AND_FORGET,
            ..Default::default()
        };

        assert!(a.put(b"fire", "forget", options).is_ok());
    }

    #[test]
    fn get_listener_events() {
        let testnet = Testnet::new(10).unwrap();
        let a = Dht::builder().testnet(&testnet).build().unwrap();
        a.integrate(true).unwrap();

        testnet.nodes[3]
            .put(b"observed", "value", PutOptions::default())
            .unwrap();

        let (listener, events) = ChannelListener::new();
        let values: Vec<StoredValue> = a
            .get_with_listener(b"observed", GetOptions::default(), listener)
            .unwrap()
            .collect();
        assert!(!values.is_empty());

        let events: Vec<OperationEvent> = events.drain().collect();

        assert!(events
            .iter()
            .any(|event| matches!(event, OperationEvent::Searching { .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, OperationEvent::Read { .. })));
        assert!(matches!(
            events.last(),
            Some(OperationEvent::Complete { timed_out: false })
        ));
    }

    #[test]
    fn remove() {
        let testnet = Testnet::new(10).unwrap();
        let a = Dht::builder().testnet(&testnet).build().unwrap();
        let b = Dht::builder().testnet(&testnet).build().unwrap();
        a.integrate(true).unwrap();
        b.integrate(true).unwrap();

        a.put(b"gone", "soon", PutOptions::default()).unwrap();
        assert!(a.remove(b"gone").unwrap() > 0);

        let values: Vec<StoredValue> = b
            .get(
                b"gone",
                GetOptions {
                    exhaustive: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .collect();

        assert!(values.is_empty());
    }

    #[test]
    fn suspend_and_resume() {
        let testnet = Testnet::new(5).unwrap();
        let a = Dht::builder().testnet(&testnet).build().unwrap();
        a.integrate(true).unwrap();

        a.set_suspended(true).unwrap();
        assert!(a.info().unwrap().suspended());

        let (sender, receiver) = flume::bounded(1);
        let clone = a.clone();
        thread::spawn(move || {
            let _ = sender.send(clone.lookup(Id::random()));
        });

        thread::sleep(Duration::from_millis(200));
        assert!(receiver.try_recv().is_err());

        a.set_suspended(false).unwrap();

        let start = Instant::now();
        let closest = receiver.recv().unwrap().unwrap();
        assert!(!closest.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
