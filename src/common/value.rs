//! Values stored in the DHT and the small codes describing them.

use std::{
    fmt::{self, Debug, Formatter},
    ops::BitOr,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::common::{Contact, Id};

/// Maximum size of a single value's payload in bytes.
pub const MAX_VALUE_SIZE: usize = 512;

/// Upper bound of a value's life, regardless of what its publisher asked for.
pub const MAX_VALUE_LIFETIME: Duration = Duration::from_secs(72 * 60 * 60);

/// Byte marking "use the default" in the wire encoding of [ReplicationControl].
pub const REPLICATION_DEFAULT: u8 = 0xff;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
/// Flags attached to a value, with their wire compatible bit codes.
pub struct ValueFlags(u16);

impl ValueFlags {
    pub const SINGLE_VALUE: ValueFlags = ValueFlags(0x00);
    pub const DOWNLOADING: ValueFlags = ValueFlags(0x01);
    pub const SEEDING: ValueFlags = ValueFlags(0x02);
    pub const MULTI_VALUE: ValueFlags = ValueFlags(0x04);
    pub const STATS: ValueFlags = ValueFlags(0x08);
    pub const ANON: ValueFlags = ValueFlags(0x10);
    pub const PRECIOUS: ValueFlags = ValueFlags(0x20);
    pub const BRIDGED: ValueFlags = ValueFlags(0x40);
    /// Return from a put as soon as the stores are dispatched.
    pub const PUT_AND_FORGET: ValueFlags = ValueFlags(0x0100);
    /// Route lookups through a derived target instead of the key itself.
    pub const OBFUSCATE_LOOKUP: ValueFlags = ValueFlags(0x0200);

    const KNOWN: u16 = 0x7f | 0x0100 | 0x0200;

    /// Parse flags from their wire code, ignoring unknown bits.
    pub fn from_bits(bits: u16) -> Self {
        ValueFlags(bits & Self::KNOWN)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, other: ValueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(&self, other: ValueFlags) -> ValueFlags {
        ValueFlags(self.0 & !other.0)
    }

    pub fn kind(&self) -> ValueKind {
        if self.contains(Self::MULTI_VALUE) {
            ValueKind::Multi
        } else {
            ValueKind::Single
        }
    }

    /// Flags that only steer the local operation and are never stored.
    pub fn stored(&self) -> ValueFlags {
        self.without(Self::PUT_AND_FORGET)
            .without(Self::OBFUSCATE_LOOKUP)
    }
}

impl BitOr for ValueFlags {
    type Output = ValueFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ValueFlags(self.0 | rhs.0)
    }
}

impl Debug for ValueFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const NAMES: [(ValueFlags, &str); 9] = [
            (ValueFlags::DOWNLOADING, "DOWNLOADING"),
            (ValueFlags::SEEDING, "SEEDING"),
            (ValueFlags::MULTI_VALUE, "MULTI_VALUE"),
            (ValueFlags::STATS, "STATS"),
            (ValueFlags::ANON, "ANON"),
            (ValueFlags::PRECIOUS, "PRECIOUS"),
            (ValueFlags::BRIDGED, "BRIDGED"),
            (ValueFlags::PUT_AND_FORGET, "PUT_AND_FORGET"),
            (ValueFlags::OBFUSCATE_LOOKUP, "OBFUSCATE_LOOKUP"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            write!(f, "ValueFlags(SINGLE_VALUE)")
        } else {
            write!(f, "ValueFlags({})", set.join(" | "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How many values a key can hold.
pub enum ValueKind {
    /// At most one value per key, the latest writer wins.
    Single,
    /// One value per origin, kept in insertion order.
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Per value override of republish interval and replica count.
pub enum ReplicationControl {
    #[default]
    Default,
    Custom {
        /// Republish interval in hours, `None` for the configured default.
        republish_hours: Option<u8>,
        /// Number of replicas to store at, `None` for the configured `k`.
        replicas: Option<u8>,
    },
}

impl ReplicationControl {
    pub fn to_bytes(&self) -> [u8; 2] {
        match self {
            ReplicationControl::Default => [REPLICATION_DEFAULT, REPLICATION_DEFAULT],
            ReplicationControl::Custom {
                republish_hours,
                replicas,
            } => [
                republish_hours.unwrap_or(REPLICATION_DEFAULT),
                replicas.unwrap_or(REPLICATION_DEFAULT),
            ],
        }
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        let decode = |byte: u8| (byte != REPLICATION_DEFAULT).then_some(byte);

        match (decode(bytes[0]), decode(bytes[1])) {
            (None, None) => ReplicationControl::Default,
            (republish_hours, replicas) => ReplicationControl::Custom {
                republish_hours,
                replicas,
            },
        }
    }

    pub fn republish_interval(&self) -> Option<Duration> {
        match self {
            ReplicationControl::Custom {
                republish_hours: Some(hours),
                ..
            } => Some(Duration::from_secs(*hours as u64 * 60 * 60)),
            _ => None,
        }
    }

    pub fn replicas(&self) -> Option<usize> {
        match self {
            ReplicationControl::Custom {
                replicas: Some(replicas),
                ..
            } => Some(*replicas as usize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
/// The diversification applied to a key.
pub enum DiversificationType {
    #[default]
    None,
    /// Key is read too often, values are replicated at every derived key.
    Frequency,
    /// Key holds too much data, values are fragmented across derived keys.
    Size,
}

impl DiversificationType {
    pub fn to_u8(self) -> u8 {
        match self {
            DiversificationType::None => 0,
            DiversificationType::Frequency => 1,
            DiversificationType::Size => 2,
        }
    }

    /// Unknown codes are treated as no diversification.
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => DiversificationType::Frequency,
            2 => DiversificationType::Size,
            _ => DiversificationType::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, DiversificationType::None)
    }
}

#[derive(Clone)]
/// A value held by the local store, either published by this node or
/// replicated on behalf of another.
pub struct StoredValue {
    pub(crate) key: Id,
    pub(crate) payload: Bytes,
    pub(crate) origin: Contact,
    pub(crate) flags: ValueFlags,
    pub(crate) version: u32,
    pub(crate) life_hours: u8,
    pub(crate) replication: ReplicationControl,
    pub(crate) created_at: Instant,
    pub(crate) refreshed_at: Instant,
    pub(crate) local: bool,
}

impl StoredValue {
    pub fn new(key: Id, payload: Bytes, origin: Contact) -> Self {
        let now = Instant::now();

        StoredValue {
            key,
            payload,
            origin,
            flags: ValueFlags::SINGLE_VALUE,
            version: 0,
            life_hours: 0,
            replication: ReplicationControl::Default,
            created_at: now,
            refreshed_at: now,
            local: false,
        }
    }

    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags.stored();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_life_hours(mut self, life_hours: u8) -> Self {
        self.life_hours = life_hours;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationControl) -> Self {
        self.replication = replication;
        self
    }

    pub(crate) fn with_created_at(mut self, created_at: Instant) -> Self {
        self.created_at = created_at;
        self.refreshed_at = created_at;
        self
    }

    pub(crate) fn with_refreshed_at(mut self, refreshed_at: Instant) -> Self {
        self.refreshed_at = refreshed_at;
        self
    }

    pub(crate) fn local(mut self) -> Self {
        self.local = true;
        self
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn origin(&self) -> &Contact {
        &self.origin
    }

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Hours until expiry counted from creation, `0` for the default.
    pub fn life_hours(&self) -> u8 {
        self.life_hours
    }

    pub fn replication(&self) -> ReplicationControl {
        self.replication
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last time this value was created, re-stored or republished.
    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    /// Returns `true` if this value was published by this node.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The instant at which this value must disappear, `None` if it never expires.
    ///
    /// `default_republish` is the interval used for remote values without an
    /// explicit life.
    pub fn expires_at(&self, default_republish: Duration) -> Option<Instant> {
        let life = if self.life_hours > 0 {
            Duration::from_secs(self.life_hours as u64 * 60 * 60).min(MAX_VALUE_LIFETIME)
        } else if self.local {
            return None;
        } else {
            let republish = self
                .replication
                .republish_interval()
                .unwrap_or(default_republish);

            (republish + republish / 2).min(MAX_VALUE_LIFETIME)
        };

        Some(self.created_at + life)
    }

    pub fn is_expired_at(&self, now: Instant, default_republish: Duration) -> bool {
        self.expires_at(default_republish)
            .map(|expires_at| now >= expires_at)
            .unwrap_or(false)
    }

    pub(crate) fn same_payload(&self, other: &StoredValue) -> bool {
        self.payload == other.payload && self.flags == other.flags
    }
}

impl Debug for StoredValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredValue")
            .field("key", &self.key)
            .field("origin", self.origin.id())
            .field("flags", &self.flags)
            .field("version", &self.version)
            .field("life_hours", &self.life_hours)
            .field("size", &self.payload.len())
            .field("local", &self.local)
            .finish()
    }
}

impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.origin.id() == other.origin.id()
            && self.version == other.version
            && self.payload == other.payload
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_from_unknown_bits() {
        let flags = ValueFlags::from_bits(0xffff);

        assert!(flags.contains(ValueFlags::MULTI_VALUE));
        assert!(flags.contains(ValueFlags::OBFUSCATE_LOOKUP));
        assert_eq!(flags.bits(), 0x037f);
    }

    #[test]
    fn stored_flags_drop_operation_hints() {
        let flags = ValueFlags::MULTI_VALUE | ValueFlags::PUT_AND_FORGET;

        assert_eq!(flags.stored(), ValueFlags::MULTI_VALUE);
        assert_eq!(flags.kind(), ValueKind::Multi);
        assert_eq!(ValueFlags::ANON.kind(), ValueKind::Single);
    }

    #[test]
    fn replication_control_encoding() {
        assert_eq!(ReplicationControl::Default.to_bytes(), [0xff, 0xff]);
        assert_eq!(
            ReplicationControl::from_bytes([0xff, 0xff]),
            ReplicationControl::Default
        );

        let custom = ReplicationControl::Custom {
            republish_hours: Some(2),
            replicas: None,
        };

        assert_eq!(custom.to_bytes(), [2, 0xff]);
        assert_eq!(ReplicationControl::from_bytes([2, 0xff]), custom);
        assert_eq!(custom.republish_interval(), Some(Duration::from_secs(7200)));
        assert_eq!(custom.replicas(), None);
    }

    #[test]
    fn diversification_codes() {
        for kind in [
            DiversificationType::None,
            DiversificationType::Frequency,
            DiversificationType::Size,
        ] {
            assert_eq!(DiversificationType::from_u8(kind.to_u8()), kind);
        }

        assert_eq!(DiversificationType::from_u8(99), DiversificationType::None);
    }

    #[test]
    fn life_is_capped() {
        let now = Instant::now();
        let value = StoredValue::new(Id::random(), Bytes::from_static(b"v"), Contact::random())
            .with_life_hours(200)
            .with_created_at(now);

        assert_eq!(
            value.expires_at(Duration::from_secs(1)),
            Some(now + MAX_VALUE_LIFETIME)
        );
    }

    #[test]
    fn local_values_without_life_never_expire() {
        let value =
            StoredValue::new(Id::random(), Bytes::from_static(b"v"), Contact::random()).local();

        assert_eq!(value.expires_at(Duration::from_secs(1)), None);
    }
}
