//! Values this node hosts, its own and those replicated on behalf of others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::adapter::StorageAdapter;
use crate::common::{Id, StoredValue, ValueKind};

/// Maximum total payload bytes held for other nodes.
pub const MAX_TOTAL_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of [LocalStore::put].
pub enum PutOutcome {
    /// A new value was added.
    Created,
    /// The same value from the same origin was already stored, it got refreshed.
    AlreadyExists,
    /// A value from the same origin (or the single value of the key) was replaced.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// Why [LocalStore::put] refused a value.
pub enum StoreError {
    #[error("Key is blocked")]
    Blocked,
    #[error("Storage adapter rejected the key")]
    Rejected,
    /// Values for other nodes would exceed [MAX_TOTAL_SIZE].
    #[error("Local store is full")]
    Full,
}

#[derive(Debug)]
struct Mapping {
    kind: ValueKind,
    /// Values in insertion order, at most one per origin.
    values: Vec<StoredValue>,
    /// Last republish of this node's own values.
    originals_republished: Instant,
    /// Last republish of values held for other nodes.
    cached_republished: Instant,
}

#[derive(Debug)]
/// Local key to values store, with expiry and adapter notifications.
pub struct LocalStore {
    mappings: HashMap<Id, Mapping>,
    adapter: Arc<dyn StorageAdapter>,
    /// Default republish interval, bounds the life of remote values without one.
    original_republish: Duration,
    remote_size: usize,
    max_remote_size: usize,
}

impl LocalStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>, original_republish: Duration) -> Self {
        LocalStore {
            mappings: HashMap::new(),
            adapter,
            original_republish,
            remote_size: 0,
            max_remote_size: MAX_TOTAL_SIZE,
        }
    }

    pub fn with_max_remote_size(mut self, max_remote_size: usize) -> Self {
        self.max_remote_size = max_remote_size;
        self
    }

    // === Getters ===

    pub fn keys_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn values_count(&self) -> usize {
        self.mappings.values().map(|m| m.values.len()).sum()
    }

    /// Payload bytes held on behalf of other nodes.
    pub fn remote_size(&self) -> usize {
        self.remote_size
    }

    pub fn contains_key(&self, key: &Id) -> bool {
        self.mappings.contains_key(key)
    }

    /// Whether `key` currently holds a single value or one per origin.
    pub fn kind(&self, key: &Id) -> Option<ValueKind> {
        self.mappings.get(key).map(|mapping| mapping.kind)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Id> {
        self.mappings.keys()
    }

    /// Values published by this node.
    pub fn local_values(&self) -> impl Iterator<Item = &StoredValue> {
        self.mappings
            .values()
            .flat_map(|m| m.values.iter())
            .filter(|v| v.is_local())
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    // === Public Methods ===

    /// Insert or update a value.
    pub fn put(&mut self, value: StoredValue) -> Result<PutOutcome, StoreError> {
        self.put_at(value, Instant::now())
    }

    pub fn put_at(&mut self, value: StoredValue, now: Instant) -> Result<PutOutcome, StoreError> {
        let key = value.key;
        // Remote values keep their origin's creation, expiry is counted from it.
        let mut value = if value.is_local() {
            value.with_created_at(now)
        } else {
            let created_at = value.created_at.min(now);
            value.with_created_at(created_at).with_refreshed_at(now)
        };

        if self.adapter.is_key_blocked(&key) {
            return Err(StoreError::Blocked);
        }

        if !value.is_local() && self.remote_size + value.size() > self.max_remote_size {
            let replacing = self
                .mappings
                .get(&key)
                .and_then(|m| m.values.iter().find(|v| v.origin.id() == value.origin.id()))
                .map(|v| v.size())
                .unwrap_or(0);

            if self.remote_size + value.size() - replacing > self.max_remote_size {
                debug!(?key, size = self.remote_size, "Local store is full");
                return Err(StoreError::Full);
            }
        }

        if !self.mappings.contains_key(&key) {
            if !self.adapter.key_created(&key, value.is_local()) {
                return Err(StoreError::Rejected);
            }

            self.mappings.insert(
                key,
                Mapping {
                    kind: value.flags.kind(),
                    values: Vec::new(),
                    originals_republished: now,
                    cached_republished: now,
                },
            );
        }

        let adapter = self.adapter.clone();
        let Some(mapping) = self.mappings.get_mut(&key) else {
            return Err(StoreError::Rejected);
        };

        let kind = value.flags.kind();
        mapping.kind = kind;

        if kind == ValueKind::Single {
            // A single value key keeps at most the incoming origin's value.
            let mut dropped = Vec::new();
            mapping.values.retain(|existing| {
                let keep = existing.origin.id() == value.origin.id();
                if !keep {
                    dropped.push(existing.clone());
                }
                keep
            });

            let replaced_other = !dropped.is_empty();

            for old in dropped {
                if !old.is_local() {
                    self.remote_size -= old.size();
                }
                adapter.value_deleted(&key, &old);
            }

            if replaced_other && mapping.values.is_empty() {
                if !value.is_local() {
                    self.remote_size += value.size();
                }
                adapter.value_added(&key, &value);
                mapping.values.push(value);

                return Ok(PutOutcome::Replaced);
            }
        }

        let existing = mapping
            .values
            .iter_mut()
            .find(|existing| existing.origin.id() == value.origin.id());

        let Some(existing) = existing else {
            if !value.is_local() {
                self.remote_size += value.size();
            }
            adapter.value_added(&key, &value);
            mapping.values.push(value);

            trace!(?key, "Created value");
            return Ok(PutOutcome::Created);
        };

        if !value.is_local() && value.version < existing.version {
            trace!(?key, "Ignored older version");
            return Ok(PutOutcome::AlreadyExists);
        }

        if existing.same_payload(&value) {
            existing.version = if value.is_local() {
                value.version.max(existing.version.wrapping_add(1))
            } else {
                value.version
            };
            existing.origin = value.origin;
            existing.life_hours = value.life_hours;
            existing.replication = value.replication;
            existing.created_at = value.created_at;
            existing.refreshed_at = now;

            return Ok(PutOutcome::AlreadyExists);
        }

        if value.is_local() && value.version <= existing.version {
            value.version = existing.version.wrapping_add(1);
        }

        let old = std::mem::replace(existing, value);

        if !old.is_local() {
            self.remote_size -= old.size();
        }
        if !existing.is_local() {
            self.remote_size += existing.size();
        }

        adapter.value_updated(&key, &old, existing);

        Ok(PutOutcome::Replaced)
    }

    /// Live values of a key, most recently refreshed first, at most
    /// `max_values` of them (`0` for all).
    pub fn get(&self, key: &Id, max_values: usize) -> Vec<StoredValue> {
        self.get_at(key, max_values, Instant::now())
    }

    pub fn get_at(&self, key: &Id, max_values: usize, now: Instant) -> Vec<StoredValue> {
        let Some(mapping) = self.mappings.get(key) else {
            return Vec::new();
        };

        let mut values: Vec<StoredValue> = mapping
            .values
            .iter()
            .filter(|v| !v.is_expired_at(now, self.original_republish))
            .cloned()
            .collect();

        // Stable, so equally fresh values keep their insertion order.
        values.sort_by(|a, b| b.refreshed_at.cmp(&a.refreshed_at));

        if max_values > 0 {
            values.truncate(max_values);
        }

        values
    }

    /// Remove all values of a key, or only those published by `origin`.
    ///
    /// Returns the number of removed values.
    pub fn remove(&mut self, key: &Id, origin: Option<&Id>) -> usize {
        let Some(mapping) = self.mappings.get_mut(key) else {
            return 0;
        };

        let mut removed = Vec::new();
        mapping.values.retain(|v| {
            let keep = origin.map(|o| v.origin.id() != o).unwrap_or(false);
            if !keep {
                removed.push(v.clone());
            }
            keep
        });

        let now_empty = mapping.values.is_empty();

        for value in &removed {
            self.value_removed(key, value);
        }

        if now_empty {
            self.mappings.remove(key);
            self.adapter.key_deleted(key);
        }

        removed.len()
    }

    /// Remove expired values, returns how many were removed.
    pub fn expire(&mut self) -> usize {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> usize {
        let original_republish = self.original_republish;
        let mut expired = Vec::new();

        for (key, mapping) in self.mappings.iter_mut() {
            mapping.values.retain(|v| {
                let keep = !v.is_expired_at(now, original_republish);
                if !keep {
                    expired.push((*key, v.clone()));
                }
                keep
            });
        }

        for (key, value) in &expired {
            self.value_removed(key, value);
        }

        let empty: Vec<Id> = self
            .mappings
            .iter()
            .filter(|(_, m)| m.values.is_empty())
            .map(|(key, _)| *key)
            .collect();

        for key in empty {
            self.mappings.remove(&key);
            self.adapter.key_deleted(&key);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired values");
        }

        expired.len()
    }

    /// Keys holding values of this node that are due for republishing, with
    /// those values. Marks them republished.
    ///
    /// Values without an explicit life are handed out as created `now`, so
    /// replicas restart their expiry countdown.
    pub fn take_due_originals(&mut self, now: Instant) -> Vec<(Id, Vec<StoredValue>)> {
        let default = self.original_republish;

        let mut due = self.take_due(
            now,
            |mapping| &mut mapping.originals_republished,
            |value| {
                value
                    .is_local()
                    .then(|| value.replication.republish_interval().unwrap_or(default))
            },
        );

        for value in due.iter_mut().flat_map(|(_, values)| values.iter_mut()) {
            if value.life_hours == 0 {
                value.created_at = now;
            }
        }

        due
    }

    /// Keys holding values of other nodes not republished for `interval`,
    /// with those values. Marks them republished.
    pub fn take_due_cached(
        &mut self,
        now: Instant,
        interval: Duration,
    ) -> Vec<(Id, Vec<StoredValue>)> {
        self.take_due(
            now,
            |mapping| &mut mapping.cached_republished,
            |value| (!value.is_local()).then_some(interval),
        )
    }

    /// Force every mapping to be due at the next republish check.
    pub fn reset_republish(&mut self, now: Instant) {
        let long_ago = self.original_republish.max(Duration::from_secs(24 * 60 * 60));

        for mapping in self.mappings.values_mut() {
            if let Some(long_ago) = now.checked_sub(long_ago) {
                mapping.originals_republished = long_ago;
                mapping.cached_republished = long_ago;
            }
        }
    }

    // === Private Methods ===

    fn take_due(
        &mut self,
        now: Instant,
        clock: impl Fn(&mut Mapping) -> &mut Instant,
        interval_of: impl Fn(&StoredValue) -> Option<Duration>,
    ) -> Vec<(Id, Vec<StoredValue>)> {
        let original_republish = self.original_republish;
        let mut due = Vec::new();

        for (key, mapping) in self.mappings.iter_mut() {
            let elapsed = now.saturating_duration_since(*clock(mapping));

            let values: Vec<StoredValue> = mapping
                .values
                .iter()
                .filter(|v| !v.is_expired_at(now, original_republish))
                .filter(|v| interval_of(v).map(|i| elapsed >= i).unwrap_or(false))
                .cloned()
                .collect();

            if !values.is_empty() {
                *clock(mapping) = now;
                due.push((*key, values));
            }
        }

        due
    }

    fn value_removed(&mut self, key: &Id, value: &StoredValue) {
        if !value.is_local() {
            self.remote_size = self.remote_size.saturating_sub(value.size());
        }

        self.adapter.value_deleted(key, value);
    }
}
