//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::{
    net::{SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use crate::common::Id;

/// The number of consecutive failures after which a contact is evicted.
pub const MAX_CONSECUTIVE_FAILURES: u8 = 3;

/// The age of a contact after which it should be pinged before being trusted.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Capabilities a remote node advertised about itself.
pub struct ContactFlags {
    /// The node sits behind a NAT but accepts hole-punching through a
    /// [NatPuncher](crate::adapter::NatPuncher).
    pub accepts_nat_punch: bool,
}

#[derive(Debug, Clone)]
/// Contact entry in the Kademlia routing table
pub struct Contact {
    id: Id,
    address: SocketAddr,
    last_seen: Instant,
    failures: u8,
    rtt: Option<Duration>,
    flags: ContactFlags,
    alive: bool,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            last_seen: Instant::now(),
            failures: 0,
            rtt: None,
            flags: ContactFlags::default(),
            alive: false,
        }
    }

    /// Creates a contact with random Id for testing purposes.
    pub fn random() -> Contact {
        Contact::new(
            Id::random(),
            SocketAddr::from(SocketAddrV4::new(0.into(), rand::random())),
        )
    }

    /// Creates a contact with a unique port, for testing purposes.
    pub fn unique(i: usize) -> Contact {
        Contact::new(
            Id::random(),
            SocketAddr::from(SocketAddrV4::new([127, 0, 0, 1].into(), i as u16)),
        )
    }

    pub fn with_flags(mut self, flags: ContactFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_last_seen(mut self, last_seen: Instant) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = Some(rtt);
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Consecutive failed requests since the last successful one.
    pub fn failures(&self) -> u8 {
        self.failures
    }

    /// Smoothed round trip estimate, if this contact ever replied.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn flags(&self) -> ContactFlags {
        self.flags
    }

    /// Returns `true` if this contact responded to us at least once, and
    /// hasn't failed since.
    pub fn is_alive(&self) -> bool {
        self.alive && self.failures == 0
    }

    /// Contacts that failed too many times in a row are considered dead.
    pub fn is_dead(&self) -> bool {
        self.failures >= MAX_CONSECUTIVE_FAILURES
    }

    /// Node is last seen more than [STALE_TIME] ago.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }

    /// Returns `true` if this contact should be pinged before it can be relied upon.
    pub fn should_ping(&self) -> bool {
        self.failures > 0 || self.is_stale()
    }

    pub fn same_address(&self, other: &Contact) -> bool {
        self.address == other.address
    }

    // === Public Methods ===

    /// Record a successful exchange with this contact.
    pub fn mark_alive(&mut self, rtt: Option<Duration>) {
        self.last_seen = Instant::now();
        self.failures = 0;
        self.alive = true;

        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                // Exponentially weighted moving average, 1/8 weight for the new sample.
                Some(previous) => (previous * 7 + sample) / 8,
                None => sample,
            });
        }
    }

    /// Record a failed request to this contact and return the updated failure count.
    pub fn mark_failed(&mut self) -> u8 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Merge what we learned about the same node from a newer observation.
    pub(crate) fn merge(&mut self, newer: &Contact) {
        self.address = newer.address;
        self.flags = newer.flags;

        if newer.alive {
            self.mark_alive(newer.rtt);
        } else if newer.last_seen > self.last_seen {
            self.last_seen = newer.last_seen;
        }
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failures_reset_on_success() {
        let mut contact = Contact::random();

        assert_eq!(contact.mark_failed(), 1);
        assert_eq!(contact.mark_failed(), 2);
        assert!(!contact.is_dead());
        assert_eq!(contact.mark_failed(), 3);
        assert!(contact.is_dead());

        contact.mark_alive(None);

        assert_eq!(contact.failures(), 0);
        assert!(contact.is_alive());
    }

    #[test]
    fn rtt_is_smoothed() {
        let mut contact = Contact::random();

        contact.mark_alive(Some(Duration::from_millis(80)));
        assert_eq!(contact.rtt(), Some(Duration::from_millis(80)));

        contact.mark_alive(Some(Duration::from_millis(160)));
        assert_eq!(contact.rtt(), Some(Duration::from_millis(90)));
    }

    #[test]
    fn merge_keeps_newest_address() {
        let mut old = Contact::unique(1);
        let mut newer = Contact::new(*old.id(), Contact::unique(2).address());
        newer.mark_alive(None);

        old.mark_failed();
        old.merge(&newer);

        assert_eq!(old.address(), newer.address());
        assert!(old.is_alive());
    }
}
