//! Host supplied policies: storage decisions and NAT hole punching.
//!
//! The DHT calls a [StorageAdapter] synchronously from its store and
//! request paths, so implementations must return quickly and never block on
//! I/O. [MemoryStorageAdapter] is the default policy.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    net::IpAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use flume::Sender;
use tracing::{debug, info, warn};

use crate::common::{Contact, DiversificationType, Id, StoredValue};
use crate::core::diversification::{diversification_lifetime, DiversificationTable};

/// Total payload size of a key above which it gets size diversified.
pub const LOCAL_DIVERSIFICATION_SIZE_LIMIT: usize = 32 * 1024;
/// Number of values of a key above which it gets size diversified.
pub const LOCAL_DIVERSIFICATION_ENTRIES_LIMIT: usize = LOCAL_DIVERSIFICATION_SIZE_LIMIT / 16;
/// Length of the read rate sampling window, in minutes.
pub const LOCAL_DIVERSIFICATION_READS_PER_MIN_SAMPLES: u32 = 3;
/// Distinct readers per minute above which a key gets frequency diversified.
pub const LOCAL_DIVERSIFICATION_READS_PER_MIN: u32 = 30;
/// Maximum number of keys tracked for other nodes.
pub const MAX_STORAGE_KEYS: usize = 65536;

const READ_WINDOW: Duration =
    Duration::from_secs(LOCAL_DIVERSIFICATION_READS_PER_MIN_SAMPLES as u64 * 60);

/// Storage policy consulted by the DHT.
///
/// Every method has a permissive default, so implementations only override
/// what they care about.
pub trait StorageAdapter: Debug + Send + Sync {
    /// A new key is about to be stored. Returning `false` rejects it,
    /// usually because the host is out of space.
    fn key_created(&self, _key: &Id, _local: bool) -> bool {
        true
    }

    /// The last value of a key was removed.
    fn key_deleted(&self, _key: &Id) {}

    /// A remote node read a key we store.
    fn key_read(&self, _key: &Id, _reader: &Contact) {}

    fn value_added(&self, _key: &Id, _value: &StoredValue) {}

    fn value_updated(&self, _key: &Id, _old: &StoredValue, _new: &StoredValue) {}

    fn value_deleted(&self, _key: &Id, _value: &StoredValue) {}

    /// Blocked keys are neither stored nor served.
    fn is_key_blocked(&self, _key: &Id) -> bool {
        false
    }

    /// Diversification of a key this node stores for others, reported to
    /// remote readers and writers so that they move elsewhere.
    fn local_diversification(&self, _key: &Id) -> DiversificationType {
        DiversificationType::None
    }

    /// Returns `true` if operations on `key` are currently redirected.
    fn is_diversified(&self, _key: &Id) -> bool {
        false
    }

    /// Keys an operation on `key` should address, `[key]` if not diversified.
    /// An empty result means the key is over-diversified.
    fn existing_diversification(
        &self,
        key: &Id,
        _put: bool,
        _exhaustive: bool,
        _max_depth: u8,
    ) -> Vec<Id> {
        vec![*key]
    }

    /// A remote node told us `key` is diversified; record it and return the
    /// keys to retry on. An empty result refuses the diversification.
    fn create_new_diversification(
        &self,
        key: &Id,
        _cause: Option<&Contact>,
        _put: bool,
        _diversification: DiversificationType,
        _exhaustive: bool,
        _max_depth: u8,
    ) -> Vec<Id> {
        vec![*key]
    }

    /// Reserve `count` consecutive value versions, returning the first one.
    fn next_value_versions(&self, count: u32) -> u32;
}

#[derive(Debug)]
/// Default [StorageAdapter] keeping all its bookkeeping in memory.
pub struct MemoryStorageAdapter {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Keys we store values under, and their load statistics.
    local_keys: HashMap<Id, StorageKey>,
    /// Diversifications we learned from other nodes.
    remote: DiversificationTable,
    blocked: HashSet<Id>,
    next_version: u32,
    suspend_diversifications_until: Option<Instant>,
}

#[derive(Debug)]
struct StorageKey {
    kind: DiversificationType,
    expires_at: Instant,
    size: usize,
    entries: usize,
    read_window_start: Instant,
    readers: HashSet<IpAddr>,
    reads_per_minute: u32,
}

impl StorageKey {
    fn new(now: Instant) -> Self {
        StorageKey {
            kind: DiversificationType::None,
            expires_at: now + diversification_lifetime(),
            size: 0,
            entries: 0,
            read_window_start: now,
            readers: HashSet::new(),
            reads_per_minute: 0,
        }
    }

    fn diversification_at(&mut self, now: Instant) -> DiversificationType {
        if !self.kind.is_none() && now >= self.expires_at {
            self.kind = DiversificationType::None;
        }

        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Load statistics of a stored key.
pub struct KeyStats {
    pub size: usize,
    pub entries: usize,
    pub reads_per_minute: u32,
    pub diversification: DiversificationType,
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        MemoryStorageAdapter {
            state: Mutex::new(State::default()),
        }
    }

    // === Public Methods ===

    /// Refuse to store or serve `key`.
    pub fn block_key(&self, key: Id) {
        info!(?key, "Blocking key");
        self.state().blocked.insert(key);
    }

    pub fn unblock_key(&self, key: &Id) {
        self.state().blocked.remove(key);
    }

    /// Stop creating new diversifications for a while.
    pub fn suspend_diversifications(&self, duration: Duration) {
        self.state().suspend_diversifications_until = Some(Instant::now() + duration);
    }

    /// Forget a diversification learned from the network.
    pub fn clear_diversification(&self, key: &Id) {
        self.state().remote.remove(key);
    }

    pub fn key_stats(&self, key: &Id) -> Option<KeyStats> {
        let now = Instant::now();

        self.state().local_keys.get_mut(key).map(|sk| KeyStats {
            size: sk.size,
            entries: sk.entries,
            reads_per_minute: sk.reads_per_minute,
            diversification: sk.diversification_at(now),
        })
    }

    /// Number of keys tracked.
    pub fn key_count(&self) -> usize {
        self.state().local_keys.len()
    }

    pub(crate) fn key_read_at(&self, key: &Id, reader: &Contact, now: Instant) {
        let mut state = self.state();
        let suspended = state.diversifications_suspended(now);

        let Some(sk) = state.local_keys.get_mut(key) else {
            return;
        };

        if !sk.kind.is_none() {
            return;
        }

        if now.saturating_duration_since(sk.read_window_start) > READ_WINDOW {
            let readers = sk.readers.len() as u32;

            sk.reads_per_minute = readers / LOCAL_DIVERSIFICATION_READS_PER_MIN_SAMPLES;
            if sk.reads_per_minute == 0 && readers > 0 {
                sk.reads_per_minute = 1;
            }

            if readers > LOCAL_DIVERSIFICATION_READS_PER_MIN * LOCAL_DIVERSIFICATION_READS_PER_MIN_SAMPLES
                && !suspended
            {
                debug!(?key, readers, "Frequency diversification");
                sk.kind = DiversificationType::Frequency;
                sk.expires_at = now + diversification_lifetime();
            }

            // This read only restarts the window.
            sk.read_window_start = now;
            sk.readers.clear();
        } else {
            sk.readers.insert(reader.address().ip());
        }
    }

    // === Private Methods ===

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain bookkeeping behind, keep using it.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn value_changed(&self, key: &Id, entries_diff: isize, size_diff: isize) {
        let mut state = self.state();
        let suspended = state.diversifications_suspended(Instant::now());

        let Some(sk) = state.local_keys.get_mut(key) else {
            return;
        };

        sk.entries = sk.entries.saturating_add_signed(entries_diff);
        sk.size = sk.size.saturating_add_signed(size_diff);

        if sk.kind.is_none() && !suspended {
            if sk.size > LOCAL_DIVERSIFICATION_SIZE_LIMIT {
                debug!(?key, size = sk.size, "Size diversification");
                sk.kind = DiversificationType::Size;
            } else if sk.entries > LOCAL_DIVERSIFICATION_ENTRIES_LIMIT {
                debug!(?key, entries = sk.entries, "Size diversification (entries)");
                sk.kind = DiversificationType::Size;
            }
        }
    }
}

impl State {
    fn diversifications_suspended(&self, now: Instant) -> bool {
        self.suspend_diversifications_until
            .map(|until| now < until)
            .unwrap_or(false)
    }
}

impl Default for MemoryStorageAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for MemoryStorageAdapter {
    fn key_created(&self, key: &Id, local: bool) -> bool {
        let mut state = self.state();

        if state.blocked.contains(key) {
            return false;
        }

        if !state.local_keys.contains_key(key) {
            // Our own keys are tracked too, but never refused.
            if !local && state.local_keys.len() >= MAX_STORAGE_KEYS {
                warn!(?key, "Max storage keys exceeded");
                return false;
            }

            state.local_keys.insert(*key, StorageKey::new(Instant::now()));
        }

        true
    }

    fn key_deleted(&self, key: &Id) {
        self.state().local_keys.remove(key);
    }

    fn key_read(&self, key: &Id, reader: &Contact) {
        self.key_read_at(key, reader, Instant::now())
    }

    fn value_added(&self, key: &Id, value: &StoredValue) {
        self.value_changed(key, 1, value.size() as isize)
    }

    fn value_updated(&self, key: &Id, old: &StoredValue, new: &StoredValue) {
        self.value_changed(key, 0, new.size() as isize - old.size() as isize)
    }

    fn value_deleted(&self, key: &Id, value: &StoredValue) {
        self.value_changed(key, -1, -(value.size() as isize))
    }

    fn is_key_blocked(&self, key: &Id) -> bool {
        self.state().blocked.contains(key)
    }

    fn local_diversification(&self, key: &Id) -> DiversificationType {
        let now = Instant::now();

        self.state()
            .local_keys
            .get_mut(key)
            .map(|sk| sk.diversification_at(now))
            .unwrap_or_default()
    }

    fn is_diversified(&self, key: &Id) -> bool {
        self.state().remote.lookup(key, Instant::now()).is_some()
    }

    fn existing_diversification(
        &self,
        key: &Id,
        put: bool,
        exhaustive: bool,
        max_depth: u8,
    ) -> Vec<Id> {
        let now = Instant::now();
        let mut state = self.state();

        if state.diversifications_suspended(now) {
            return vec![*key];
        }

        state
            .remote
            .follow_chain(key, put, exhaustive, max_depth, now)
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
        let now = Instant::now();
        let mut state = self.state();

        if state.diversifications_suspended(now) && put {
            return Vec::new();
        }

        let created = state.remote.create(*key, diversification, now);

        debug!(
            ?key,
            ?diversification,
            created,
            put,
            cause = ?cause.map(|c| *c.id()),
            "Diversify"
        );

        state
            .remote
            .follow_chain(key, put, exhaustive, max_depth, now)
    }

    fn next_value_versions(&self, count: u32) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0);

        let mut state = self.state();

        // Live with a "next" in the future, the clock may have gone backwards.
        let next = state.next_version.max(now);
        state.next_version = next.wrapping_add(count);

        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of a hole punching attempt.
pub struct PunchOutcome {
    pub contact: Id,
    pub success: bool,
}

#[derive(Debug)]
/// Handle given to a [NatPuncher] to report the outcome of one attempt.
///
/// Dropping it without reporting counts as a failed attempt.
pub struct PunchReporter {
    contact: Id,
    sender: Sender<PunchOutcome>,
    reported: bool,
}

impl PunchReporter {
    pub(crate) fn new(contact: Id, sender: Sender<PunchOutcome>) -> Self {
        PunchReporter {
            contact,
            sender,
            reported: false,
        }
    }

    /// Report the outcome, may be called from any thread.
    pub fn report(mut self, success: bool) {
        self.send(success)
    }

    fn send(&mut self, success: bool) {
        if self.reported {
            return;
        }
        self.reported = true;

        let _ = self.sender.send(PunchOutcome {
            contact: self.contact,
            success,
        });
    }
}

impl Drop for PunchReporter {
    fn drop(&mut self) {
        if !self.reported {
            debug!(contact = ?self.contact, "Punch reporter dropped without an outcome");
            self.send(false)
        }
    }
}

/// Makes contacts behind NATs reachable on demand.
pub trait NatPuncher: Debug + Send {
    /// Try to open a path to `contact` and eventually call [PunchReporter::report].
    fn punch(&mut self, contact: &Contact, reporter: PunchReporter);
}

#[derive(Debug, Default)]
/// [NatPuncher] that never succeeds.
pub struct NoopNatPuncher;

impl NatPuncher for NoopNatPuncher {
    fn punch(&mut self, _contact: &Contact, reporter: PunchReporter) {
        reporter.report(false)
    }
}
