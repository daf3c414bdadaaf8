//! Expiry sweep and republish timers of the local store.

use std::time::{Duration, Instant};

use crate::common::{Id, StoredValue};
use crate::core::store::LocalStore;

/// How often the store is checked for expired or due values.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RepublishSchedule {
    cache_republish_interval: Duration,
    last_sweep: Instant,
}

#[derive(Debug, Default)]
/// Work found due by [RepublishSchedule::decisions_at].
pub struct RepublishDecisions {
    /// Number of values dropped by the expiry sweep.
    pub expired: usize,
    /// Our own values to announce again, by key.
    pub originals: Vec<(Id, Vec<StoredValue>)>,
    /// Values of other nodes we hold, to store again at the closest nodes.
    pub cached: Vec<(Id, Vec<StoredValue>)>,
}

impl RepublishDecisions {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.originals.is_empty() && self.cached.is_empty()
    }
}

impl RepublishSchedule {
    pub fn new(cache_republish_interval: Duration) -> Self {
        Self {
            cache_republish_interval,
            last_sweep: Instant::now(),
        }
    }

    pub fn decisions(&mut self, store: &mut LocalStore) -> RepublishDecisions {
        self.decisions_at(Instant::now(), store)
    }

    /// Sweep expired values and collect the republish work due at `now`.
    ///
    /// Work missed while not being called, like during suspension, is
    /// returned at the next call.
    pub fn decisions_at(&mut self, now: Instant, store: &mut LocalStore) -> RepublishDecisions {
        if now.saturating_duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return RepublishDecisions::default();
        }

        self.last_sweep = now;

        let expired = store.expire_at(now);
        let originals = store.take_due_originals(now);
        let cached = store.take_due_cached(now, self.cache_republish_interval);

        RepublishDecisions {
            expired,
            originals,
            cached,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::adapter::MemoryStorageAdapter;
    use crate::common::Contact;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn sweeps_and_republishes() {
        let now = Instant::now();
        let mut store = LocalStore::new(Arc::new(MemoryStorageAdapter::new()), 8 * HOUR);
        let mut schedule = RepublishSchedule::new(HOUR / 2);
        schedule.last_sweep = now;

        let key = Id::random();
        let remote_key = Id::random();
        let short_lived = Id::random();

        store
            .put_at(
                StoredValue::new(key, Bytes::from_static(b"mine"), Contact::random()).local(),
                now,
            )
            .unwrap();
        store
            .put_at(
                StoredValue::new(remote_key, Bytes::from_static(b"theirs"), Contact::random()),
                now,
            )
            .unwrap();
        store
            .put_at(
                StoredValue::new(short_lived, Bytes::from_static(b"gone"), Contact::random())
                    .with_life_hours(1)
                    .with_created_at(now),
                now,
            )
            .unwrap();

        // Not time to look yet.
        assert!(schedule
            .decisions_at(now + Duration::from_secs(1), &mut store)
            .is_empty());

        let decisions = schedule.decisions_at(now + HOUR, &mut store);
        assert_eq!(decisions.expired, 1);
        assert!(decisions.originals.is_empty());
        assert_eq!(decisions.cached.len(), 1);
        assert_eq!(decisions.cached[0].0, remote_key);

        let decisions = schedule.decisions_at(now + 8 * HOUR, &mut store);
        assert_eq!(decisions.originals.len(), 1);
        assert_eq!(decisions.originals[0].0, key);
    }
}
