//! Derived keys used to spread a hot or oversized key over the Id space.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::{seq::index::sample, Rng};
use tracing::debug;

use crate::common::{DiversificationType, Id};

/// Number of derived keys a diversified key fans out to.
pub const DIV_WIDTH: u8 = 10;
/// Number of derived keys used by size diversified puts and non exhaustive gets.
pub const DIV_FRAG_GET_SIZE: usize = 2;
/// Minimum lifetime of a diversification.
pub const DIV_EXPIRY_MIN: Duration = Duration::from_secs(2 * 24 * 60 * 60);
/// Random extra lifetime of a diversification, so that they don't all expire together.
pub const DIV_EXPIRY_RAND: Duration = Duration::from_secs(24 * 60 * 60);

/// Derive the `offset`th alternate key: `SHA1(key || offset)`.
pub fn diversify_key(key: &Id, offset: u8) -> Id {
    let mut hasher = sha1_smol::Sha1::new();

    hasher.update(key.as_bytes());
    hasher.update(&[offset]);

    hasher.digest().bytes().into()
}

/// Random lifetime for a new diversification.
pub fn diversification_lifetime() -> Duration {
    let extra = rand::thread_rng().gen_range(0..DIV_EXPIRY_RAND.as_secs());

    DIV_EXPIRY_MIN + Duration::from_secs(extra)
}

#[derive(Debug, Clone)]
/// A diversification learned from the network for a key.
pub struct Diversification {
    key: Id,
    kind: DiversificationType,
    expires_at: Instant,
    /// Offsets size diversified puts always write to, so that repeated puts
    /// don't end up covering every derived key.
    fixed_put_offsets: [u8; DIV_FRAG_GET_SIZE],
}

impl Diversification {
    pub fn new(key: Id, kind: DiversificationType, now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        let offsets = sample(&mut rng, DIV_WIDTH as usize, DIV_FRAG_GET_SIZE);

        let mut fixed_put_offsets = [0; DIV_FRAG_GET_SIZE];
        for (slot, offset) in fixed_put_offsets.iter_mut().zip(offsets.iter()) {
            *slot = offset as u8;
        }

        Diversification {
            key,
            kind,
            expires_at: now + diversification_lifetime(),
            fixed_put_offsets,
        }
    }

    // === Getters ===

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn kind(&self) -> DiversificationType {
        self.kind
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    // === Public Methods ===

    /// Keys an operation on this diversified key should address instead.
    ///
    /// Puts are deterministic so that every publisher lands on the same
    /// derived keys, gets are randomized to spread the load.
    pub fn keys(&self, put: bool, exhaustive: bool) -> Vec<Id> {
        let mut keys = Vec::with_capacity(DIV_WIDTH as usize + 1);

        match (put, self.kind) {
            (_, DiversificationType::None) => keys.push(self.key),
            (true, DiversificationType::Frequency) => {
                keys.extend((0..DIV_WIDTH).map(|offset| diversify_key(&self.key, offset)));

                if exhaustive {
                    keys.push(self.key);
                }
            }
            (true, DiversificationType::Size) => {
                keys.extend(
                    self.fixed_put_offsets
                        .iter()
                        .map(|offset| diversify_key(&self.key, *offset)),
                );

                if exhaustive {
                    keys.push(self.key);
                }
            }
            (false, DiversificationType::Frequency) => {
                let offset = rand::thread_rng().gen_range(0..DIV_WIDTH);
                keys.push(diversify_key(&self.key, offset));
            }
            (false, DiversificationType::Size) => {
                if exhaustive {
                    keys.extend((0..DIV_WIDTH).map(|offset| diversify_key(&self.key, offset)));
                } else {
                    let mut rng = rand::thread_rng();

                    for offset in sample(&mut rng, DIV_WIDTH as usize, DIV_FRAG_GET_SIZE).iter() {
                        keys.push(diversify_key(&self.key, offset as u8));
                    }
                }
            }
        }

        keys
    }
}

#[derive(Debug, Default)]
/// Diversifications this node learned from remote replies, and how to
/// resolve a key through them.
pub struct DiversificationTable {
    diversifications: HashMap<Id, Diversification>,
}

impl DiversificationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.diversifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diversifications.is_empty()
    }

    /// Returns the live diversification for `key`, dropping it if expired.
    pub fn lookup(&mut self, key: &Id, now: Instant) -> Option<&Diversification> {
        if self
            .diversifications
            .get(key)
            .map(|div| div.is_expired_at(now))
            .unwrap_or(false)
        {
            debug!(?key, "Diversification expired");
            self.diversifications.remove(key);
        }

        self.diversifications.get(key)
    }

    /// Create a diversification for `key` unless one already exists.
    ///
    /// Returns `true` if it was created.
    pub fn create(&mut self, key: Id, kind: DiversificationType, now: Instant) -> bool {
        if kind.is_none() || self.lookup(&key, now).is_some() {
            return false;
        }

        debug!(?key, ?kind, "Created diversification");

        self.diversifications
            .insert(key, Diversification::new(key, kind, now));

        true
    }

    pub fn remove(&mut self, key: &Id) -> Option<Diversification> {
        self.diversifications.remove(key)
    }

    /// Resolve `key` through the chain of diversifications, up to `max_depth`
    /// levels. Returns the keys to operate on, which is `[key]` when not
    /// diversified and empty when the chain is deeper than `max_depth`.
    pub fn follow_chain(
        &mut self,
        key: &Id,
        put: bool,
        exhaustive: bool,
        max_depth: u8,
        now: Instant,
    ) -> Vec<Id> {
        let mut done = Vec::new();

        self.follow_chain_inner(vec![*key], put, exhaustive, 0, max_depth, &mut done, now)
    }

    // === Private Methods ===

    #[allow(clippy::too_many_arguments)]
    fn follow_chain_inner(
        &mut self,
        keys: Vec<Id>,
        put: bool,
        exhaustive: bool,
        depth: u8,
        max_depth: u8,
        done: &mut Vec<Id>,
        now: Instant,
    ) -> Vec<Id> {
        let mut result = Vec::new();

        if depth >= max_depth {
            debug!(?max_depth, "Terminated diversification chain");
            return result;
        }

        for key in keys {
            let derived = self
                .lookup(&key, now)
                .map(|div| div.keys(put, exhaustive));

            match derived {
                None => push_unique(&mut result, key),
                // A loop back to a key being expanded means it wants itself included.
                Some(_) if done.contains(&key) => push_unique(&mut result, key),
                Some(derived) => {
                    done.push(key);

                    for id in
                        self.follow_chain_inner(derived, put, exhaustive, depth + 1, max_depth, done, now)
                    {
                        push_unique(&mut result, id);
                    }
                }
            }
        }

        result
    }
}

fn push_unique(keys: &mut Vec<Id>, key: Id) {
    if !keys.contains(&key) {
        keys.push(key);
    }
}
