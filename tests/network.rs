use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use distdb::{
    ChannelListener, Contact, Dht, DiversificationType, GetOptions, Id, MemoryNetwork,
    MemoryStorageAdapter, OperationEvent, PutOptions, StorageAdapter, StoredValue, Testnet,
    ValueFlags,
};

fn integrated(testnet: &Testnet) -> Dht {
    let dht = Dht::builder().testnet(testnet).build().unwrap();
    assert!(dht.integrate(true).unwrap());
    dht
}

#[test]
fn basic_put_get() {
    let testnet = Testnet::new(20).unwrap();

    let writer = integrated(&testnet);
    let reader = integrated(&testnet);

    let options = PutOptions {
        life_hours: 8,
        ..Default::default()
    };
    let key = writer.put(b"K1", "V1", options).unwrap();

    let values: Vec<StoredValue> = reader.get(b"K1", GetOptions::default()).unwrap().collect();

    assert!(!values.is_empty());
    assert!(values.iter().all(|value| value.key() == &key));
    assert_eq!(values[0].payload().as_ref(), b"V1");
    assert_eq!(values[0].life_hours(), 8);
}

#[test]
fn idempotent_put() {
    let testnet = Testnet::new(10).unwrap();
    let writer = integrated(&testnet);

    writer.put(b"same", "value", PutOptions::default()).unwrap();
    writer.put(b"same", "value", PutOptions::default()).unwrap();

    let reader = integrated(&testnet);
    let values: Vec<StoredValue> = reader.get(b"same", GetOptions::default()).unwrap().collect();

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].payload().as_ref(), b"value");
}

#[test]
fn newer_value_replaces_older() {
    let testnet = Testnet::new(10).unwrap();
    let writer = integrated(&testnet);

    writer.put(b"counter", "1", PutOptions::default()).unwrap();
    writer.put(b"counter", "2", PutOptions::default()).unwrap();

    let reader = integrated(&testnet);
    let values: Vec<StoredValue> = reader
        .get(b"counter", GetOptions::default())
        .unwrap()
        .collect();

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].payload().as_ref(), b"2");
}

#[test]
fn timeout_get() {
    let testnet = Testnet::new(10).unwrap();
    let reader = integrated(&testnet);

    for node in &testnet.nodes {
        testnet
            .memory_network()
            .blackhole(node.info().unwrap().local_addr());
    }

    let (listener, events) = ChannelListener::new();

    let start = Instant::now();
    let values: Vec<StoredValue> = reader
        .get_with_listener(
            b"K2",
            GetOptions {
                timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            listener,
        )
        .unwrap()
        .collect();
    let elapsed = start.elapsed();

    assert!(values.is_empty());
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5));

    let events: Vec<OperationEvent> = events.drain().collect();
    assert!(matches!(
        events.last(),
        Some(OperationEvent::Complete { timed_out: true })
    ));
}

#[test]
fn lookup_on_empty_table() {
    let network = MemoryNetwork::new();
    let dht = Dht::builder().memory_network(&network).build().unwrap();

    assert!(!dht.integrate(true).unwrap());
    assert!(dht.lookup(Id::random()).unwrap().is_empty());
}

#[test]
fn lookup_finds_closest() {
    let testnet = Testnet::new(30).unwrap();
    let dht = integrated(&testnet);

    let target = Id::random();
    let closest = dht.lookup(target).unwrap();

    assert!(!closest.is_empty());
    assert!(closest
        .windows(2)
        .all(|pair| target.xor(pair[0].id()) <= target.xor(pair[1].id())));
}

#[test]
fn multi_network_isolation() {
    let network = MemoryNetwork::new();

    let first = Testnet::with_network(&network, 1, 10).unwrap();
    let second = Testnet::with_network(&network, 2, 10).unwrap();

    // Bootstrapping from the other network's node never integrates.
    let stranger = Dht::builder()
        .memory_network(&network)
        .network(2)
        .bootstrap(&first.bootstrap)
        .build()
        .unwrap();
    assert!(!stranger.integrate(true).unwrap());

    let writer = integrated(&first);
    writer.put(b"isolated", "value", PutOptions::default()).unwrap();

    let reader = integrated(&second);
    let values: Vec<StoredValue> = reader
        .get(b"isolated", GetOptions::default())
        .unwrap()
        .collect();

    assert!(values.is_empty());
}

#[test]
fn snapshot_warm_start() {
    let testnet = Testnet::new(10).unwrap();
    let node = integrated(&testnet);

    node.put(b"mine", "survives", PutOptions::default()).unwrap();

    let mut bytes = Vec::new();
    node.export_state(&mut bytes, 100).unwrap();
    node.destroy();

    // No bootstrap nodes, only the snapshot.
    let restarted = Dht::builder()
        .memory_network(testnet.memory_network())
        .build()
        .unwrap();

    assert!(restarted.import_state(bytes.as_slice()).unwrap() > 0);
    assert!(restarted.integrate(true).unwrap());

    let info = restarted.info().unwrap();
    assert!(info.routing_table_size() > 0);
    assert_eq!(info.keys(), 1);
}

#[test]
fn suspend_keeps_state() {
    let testnet = Testnet::new(10).unwrap();
    let node = integrated(&testnet);

    let before = node.info().unwrap().routing_table_size();

    node.set_suspended(true).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    node.set_suspended(false).unwrap();

    let info = node.info().unwrap();
    assert!(!info.suspended());
    assert_eq!(info.routing_table_size(), before);
}

#[derive(Debug)]
/// Reports one key as frequency diversified, like a node overwhelmed by readers.
struct HotKeyAdapter {
    hot: Id,
    inner: MemoryStorageAdapter,
}

impl StorageAdapter for HotKeyAdapter {
    fn key_created(&self, key: &Id, local: bool) -> bool {
        self.inner.key_created(key, local)
    }

    fn key_deleted(&self, key: &Id) {
        self.inner.key_deleted(key)
    }

    fn key_read(&self, key: &Id, reader: &Contact) {
        self.inner.key_read(key, reader)
    }

    fn value_added(&self, key: &Id, value: &StoredValue) {
        self.inner.value_added(key, value)
    }

    fn value_updated(&self, key: &Id, old: &StoredValue, new: &StoredValue) {
        self.inner.value_updated(key, old, new)
    }

    fn value_deleted(&self, key: &Id, value: &StoredValue) {
        self.inner.value_deleted(key, value)
    }

    fn local_diversification(&self, key: &Id) -> DiversificationType {
        if key == &self.hot {
            DiversificationType::Frequency
        } else {
            self.inner.local_diversification(key)
        }
    }

    fn is_diversified(&self, key: &Id) -> bool {
        self.inner.is_diversified(key)
    }

    fn existing_diversification(
        &self,
        key: &Id,
        put: bool,
        exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Id> {
        self.inner
            .existing_diversification(key, put, exhaustive, max_depth)
    }

    fn create_new_diversification(
        &self,
        key: &Id,
        cause: Option<&Contact>,
        put: bool,
        diversification: DiversificationType,
        exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Id> {
        self.inner
            .create_new_diversification(key, cause, put, diversification, exhaustive, max_depth)
    }

    fn next_value_versions(&self, count: u32) -> u32 {
        self.inner.next_value_versions(count)
    }
}

#[test]
fn diversification_round_trip() {
    let network = MemoryNetwork::new();
    let hot = Id::encode_key(b"hot");

    let mut nodes = Vec::new();
    let mut bootstrap = Vec::new();

    for _ in 0..15 {
        let node = Dht::builder()
            .memory_network(&network)
            .bootstrap(&bootstrap)
            .storage_adapter(Arc::new(HotKeyAdapter {
                hot,
                inner: MemoryStorageAdapter::new(),
            }))
            .build()
            .unwrap();

        if bootstrap.is_empty() {
            bootstrap.push(node.info().unwrap().local_addr());
        }

        node.integrate(true).unwrap();
        nodes.push(node);
    }

    let writer = Dht::builder()
        .memory_network(&network)
        .bootstrap(&bootstrap)
        .build()
        .unwrap();
    writer.integrate(true).unwrap();

    let (listener, events) = ChannelListener::new();
    writer
        .put_with_listener(b"hot", "popular", PutOptions::default(), listener)
        .unwrap();

    assert!(writer.is_diversified(b"hot").unwrap());
    assert!(events
        .drain()
        .any(|event| matches!(event, OperationEvent::Diversified { key, .. } if key == hot)));

    let reader = Dht::builder()
        .memory_network(&network)
        .bootstrap(&bootstrap)
        .build()
        .unwrap();
    reader.integrate(true).unwrap();

    let values: Vec<StoredValue> = reader
        .get(
            b"hot",
            GetOptions {
                exhaustive: true,
                ..Default::default()
            },
        )
        .unwrap()
        .collect();

    assert!(!values.is_empty());
    assert!(values.iter().all(|value| value.key() == &hot));
    assert!(values
        .iter()
        .all(|value| value.payload().as_ref() == b"popular"));
    assert!(reader.is_diversified(b"hot").unwrap());
}

#[test]
fn obfuscated_lookup_put_get() {
    let testnet = Testnet::new(15).unwrap();

    let writer = integrated(&testnet);
    let reader = integrated(&testnet);

    writer
        .put(b"secret", "value", PutOptions::default())
        .unwrap();

    let values: Vec<StoredValue> = reader
        .get(
            b"secret",
            GetOptions {
                flags: ValueFlags::OBFUSCATE_LOOKUP,
                ..Default::default()
            },
        )
        .unwrap()
        .collect();

    assert!(!values.is_empty());
}
