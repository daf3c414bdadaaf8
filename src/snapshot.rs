//! Export and import of a node's routing table contacts and own values.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::actor::validate_payload;
use crate::common::{
    Contact, Id, NoteOutcome, ReplicationControl, RoutingTable, StoredValue, ValueFlags, ID_SIZE,
};
use crate::core::store::LocalStore;
use crate::error::SnapshotError;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A bounded copy of a node's contacts, and optionally its own values, to
/// warm start a later run.
///
/// Fields unknown to this version are ignored when reading.
pub struct Snapshot {
    #[serde(rename = "v")]
    version: u8,
    #[serde(rename = "n")]
    network: u8,
    #[serde(rename = "c")]
    contacts: Vec<SnapshotContact>,
    #[serde(rename = "s", default)]
    values: Vec<SnapshotValue>,
    #[serde(rename = "x")]
    checksum: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct SnapshotContact {
    #[serde(rename = "i", with = "serde_bytes")]
    id: [u8; ID_SIZE],
    #[serde(rename = "a")]
    address: String,
    /// Seconds since the contact was last seen.
    #[serde(rename = "t")]
    age_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct SnapshotValue {
    #[serde(rename = "k", with = "serde_bytes")]
    key: [u8; ID_SIZE],
    #[serde(rename = "p")]
    payload: ByteBuf,
    #[serde(rename = "f")]
    flags: u16,
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "l")]
    life_hours: u8,
    #[serde(rename = "r", with = "serde_bytes")]
    replication: [u8; 2],
}

impl Snapshot {
    /// Capture up to `max` contacts, most recently seen first.
    pub(crate) fn capture(
        routing_table: &RoutingTable,
        store: &LocalStore,
        network: u8,
        max: usize,
        include_values: bool,
    ) -> Self {
        let now = Instant::now();

        let mut contacts: Vec<&Contact> = routing_table.contacts().collect();
        contacts.sort_by_key(|contact| std::cmp::Reverse(contact.last_seen()));

        let contacts: Vec<SnapshotContact> = contacts
            .into_iter()
            .take(max)
            .map(|contact| SnapshotContact {
                id: *contact.id().as_bytes(),
                address: contact.address().to_string(),
                age_secs: now.saturating_duration_since(contact.last_seen()).as_secs(),
            })
            .collect();

        let values = if include_values {
            store
                .local_values()
                .map(|value| SnapshotValue {
                    key: *value.key().as_bytes(),
                    payload: ByteBuf::from(value.payload().to_vec()),
                    flags: value.flags().bits(),
                    version: value.version(),
                    life_hours: value.life_hours(),
                    replication: value.replication().to_bytes(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Snapshot {
            version: SNAPSHOT_VERSION,
            network,
            checksum: checksum(&contacts),
            contacts,
            values,
        }
    }

    // === Getters ===

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Id of the logical network the snapshot was taken from.
    pub fn network(&self) -> u8 {
        self.network
    }

    /// Contacts and when they were last seen, relative to the capture time.
    pub fn contacts(&self) -> impl Iterator<Item = (Id, &str, Duration)> {
        self.contacts.iter().map(|contact| {
            (
                Id::from(contact.id),
                contact.address.as_str(),
                Duration::from_secs(contact.age_secs),
            )
        })
    }

    pub fn contacts_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn values_count(&self) -> usize {
        self.values.len()
    }

    // === Public Methods ===

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_bencode::from_bytes(bytes)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        if snapshot.checksum != checksum(&snapshot.contacts) {
            return Err(SnapshotError::ChecksumMismatch);
        }

        Ok(snapshot)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), SnapshotError> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;

        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, SnapshotError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        Self::from_bytes(&bytes)
    }

    /// Merge into a routing table and store, never replacing what is already there.
    ///
    /// Returns the number of contacts added to the routing table.
    pub(crate) fn restore(
        &self,
        routing_table: &mut RoutingTable,
        store: &mut LocalStore,
        origin: &Contact,
        network: u8,
    ) -> Result<usize, SnapshotError> {
        if self.network != network {
            return Err(SnapshotError::NetworkMismatch {
                expected: network,
                found: self.network,
            });
        }

        let now = Instant::now();
        let mut added = 0;

        for contact in &self.contacts {
            let Ok(address) = contact.address.parse::<SocketAddr>() else {
                debug!(address = contact.address, "Skipping snapshot contact with invalid address");
                continue;
            };

            let id = Id::from(contact.id);

            if routing_table.contains(&id) {
                continue;
            }

            let last_seen = now
                .checked_sub(Duration::from_secs(contact.age_secs))
                .unwrap_or(now);

            let outcome = routing_table
                .note_contact(Contact::new(id, address).with_last_seen(last_seen), false);

            if outcome == NoteOutcome::Added {
                added += 1;
            }
        }

        for value in &self.values {
            let key = Id::from(value.key);

            if store.local_values().any(|v| v.key() == &key) {
                continue;
            }

            if let Err(error) = validate_payload(&value.payload) {
                debug!(?key, ?error, "Skipping invalid snapshot value");
                continue;
            }

            let value = StoredValue::new(key, Bytes::from(value.payload.to_vec()), origin.clone())
                .with_flags(ValueFlags::from_bits(value.flags))
                .with_version(value.version)
                .with_life_hours(value.life_hours)
                .with_replication(ReplicationControl::from_bytes(value.replication))
                .local();

            if let Err(error) = store.put(value) {
                debug!(?key, ?error, "Skipping snapshot value");
            }
        }

        Ok(added)
    }
}

/// CRC32C of the contacts' ids and addresses.
fn checksum(contacts: &[SnapshotContact]) -> u32 {
    let mut digest = CASTAGNOLI.digest();

    for contact in contacts {
        digest.update(&contact.id);
        digest.update(contact.address.as_bytes());
    }

    digest.finalize()
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::MemoryStorageAdapter;
    use crate::common::MAX_VALUE_SIZE;

    fn store() -> LocalStore {
        LocalStore::new(
            Arc::new(MemoryStorageAdapter::new()),
            Duration::from_secs(60 * 60),
        )
    }

    fn table_with(contacts: &[Contact]) -> RoutingTable {
        let mut table = RoutingTable::new(Id::random());
        for contact in contacts {
            table.note_contact(contact.clone(), true);
        }
        table
    }

    #[test]
    fn round_trip() {
        let contacts: Vec<Contact> = (1..=10).map(Contact::unique).collect();
        let table = table_with(&contacts);

        let origin = Contact::random();
        let mut source = store();
        source
            .put(StoredValue::new(Id::random(), Bytes::from_static(b"mine"), origin.clone()).local())
            .unwrap();

        let snapshot = Snapshot::capture(&table, &source, 3, 100, true);

        let mut bytes = Vec::new();
        snapshot.write_to(&mut bytes).unwrap();
        let read = Snapshot::read_from(bytes.as_slice()).unwrap();

        assert_eq!(read, snapshot);
        assert_eq!(read.contacts_count(), 10);
        assert_eq!(read.values_count(), 1);

        let mut restored_table = RoutingTable::new(Id::random());
        let mut restored_store = store();
        let added = read
            .restore(&mut restored_table, &mut restored_store, &origin, 3)
            .unwrap();

        assert_eq!(added, 10);
        for contact in &contacts {
            assert!(restored_table.contains(contact.id()));
        }
        assert_eq!(restored_store.local_values().count(), 1);
    }

    #[test]
    fn capped_most_recent_first() {
        let now = Instant::now();
        let contacts: Vec<Contact> = (1..=5)
            .map(|i| Contact::unique(i).with_last_seen(now - Duration::from_secs(i as u64 * 10)))
            .collect();

        let mut table = RoutingTable::new(Id::random());
        for contact in &contacts {
            table.note_contact(contact.clone(), false);
        }

        let snapshot = Snapshot::capture(&table, &store(), 0, 2, false);

        let ids: Vec<Id> = snapshot.contacts().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec![*contacts[0].id(), *contacts[1].id()]);
        assert_eq!(snapshot.values_count(), 0);
    }

    #[test]
    fn corrupt_snapshot() {
        let table = table_with(&[Contact::unique(1), Contact::unique(2)]);
        let mut snapshot = Snapshot::capture(&table, &store(), 0, 10, false);

        snapshot.contacts.pop();

        let bytes = serde_bencode::to_bytes(&snapshot).unwrap();
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(SnapshotError::ChecksumMismatch)
        ));

        assert!(matches!(
            Snapshot::from_bytes(b"not bencode"),
            Err(SnapshotError::BencodeError(_))
        ));
    }

    #[test]
    fn other_network() {
        let table = table_with(&[Contact::unique(1)]);
        let snapshot = Snapshot::capture(&table, &store(), 1, 10, false);

        let result = snapshot.restore(
            &mut RoutingTable::new(Id::random()),
            &mut store(),
            &Contact::random(),
            2,
        );

        assert!(matches!(
            result,
            Err(SnapshotError::NetworkMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn import_merges_without_overwriting() {
        let origin = Contact::random();
        let key = Id::random();

        let mut source = store();
        source
            .put(StoredValue::new(key, Bytes::from_static(b"old"), origin.clone()).local())
            .unwrap();
        let snapshot = Snapshot::capture(&RoutingTable::new(Id::random()), &source, 0, 10, true);

        let mut live = store();
        live.put(StoredValue::new(key, Bytes::from_static(b"new"), origin.clone()).local())
            .unwrap();

        snapshot
            .restore(&mut RoutingTable::new(Id::random()), &mut live, &origin, 0)
            .unwrap();

        let values = live.get(&key, 0);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].payload(), &Bytes::from_static(b"new"));
    }

    #[test]
    fn oversized_values_are_not_imported() {
        let origin = Contact::random();
        let mut source = store();
        source
            .put(StoredValue::new(Id::random(), Bytes::from_static(b"fine"), origin.clone()).local())
            .unwrap();

        let mut snapshot =
            Snapshot::capture(&RoutingTable::new(Id::random()), &source, 0, 10, true);

        let mut oversized = snapshot.values[0].clone();
        oversized.key = *Id::random().as_bytes();
        oversized.payload = ByteBuf::from(vec![7; MAX_VALUE_SIZE + 1]);
        snapshot.values.push(oversized);

        let mut empty = snapshot.values[0].clone();
        empty.key = *Id::random().as_bytes();
        empty.payload = ByteBuf::new();
        snapshot.values.push(empty);

        let mut live = store();
        snapshot
            .restore(&mut RoutingTable::new(Id::random()), &mut live, &origin, 0)
            .unwrap();

        let restored: Vec<&StoredValue> = live.local_values().collect();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].payload().as_ref(), b"fine");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let table = table_with(&[Contact::unique(1)]);
        let snapshot = Snapshot::capture(&table, &store(), 0, 10, false);

        let mut value: serde_bencode::value::Value =
            serde_bencode::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();

        if let serde_bencode::value::Value::Dict(dict) = &mut value {
            dict.insert(b"z".to_vec(), serde_bencode::value::Value::Int(42));
        }

        let bytes = serde_bencode::to_bytes(&value).unwrap();
        assert_eq!(Snapshot::from_bytes(&bytes).unwrap(), snapshot);
    }
}
