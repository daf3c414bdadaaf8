//! Kademlia routing table: a binary tree of k-buckets split around the local Id.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{ClosestContacts, Contact, Id, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// B = the default split factor, buckets far from the local Id split every B levels.
pub const DEFAULT_SPLIT_FACTOR: usize = 4;
/// Default capacity of each bucket's replacement cache.
pub const DEFAULT_MAX_REPLACEMENTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What [RoutingTable::note_contact] did with a contact.
pub enum NoteOutcome {
    /// The contact is our own Id.
    Ignored,
    /// A new contact was added to its bucket.
    Added,
    /// An existing contact in a bucket was refreshed.
    Updated,
    /// The bucket is full, the contact waits in the replacement cache.
    Replacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What [RoutingTable::note_failure] did with a contact.
pub enum FailureOutcome {
    /// No such contact in the table.
    Unknown,
    /// The failure was counted, the contact stays.
    Counted(u8),
    /// The contact was moved to the replacement cache, and possibly replaced.
    Evicted { promoted: Option<Contact> },
}

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    split_factor: usize,
    max_replacements: usize,
    /// Arena of tree nodes, the root is at index 0.
    nodes: Vec<TreeNode>,
    /// Least recently seen contacts of full buckets that should be pinged.
    pending_pings: Vec<Contact>,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Leaf(KBucket),
    /// Children indices for the next bit being `0` and `1`.
    Branch([usize; 2]),
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: MAX_BUCKET_SIZE_K,
            split_factor: DEFAULT_SPLIT_FACTOR,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
            nodes: vec![TreeNode::Leaf(KBucket::new(id, 0))],
            pending_pings: Vec::new(),
        }
    }

    /// Set the maximum number of contacts per bucket.
    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Set how many levels buckets not containing our Id may split.
    pub fn with_split_factor(mut self, split_factor: usize) -> Self {
        self.split_factor = split_factor.max(1);
        self
    }

    pub fn with_max_replacements(mut self, max_replacements: usize) -> Self {
        self.max_replacements = max_replacements;
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table, excluding replacements.
    pub fn size(&self) -> usize {
        self.buckets().map(|bucket| bucket.contacts.len()).sum()
    }

    /// Return the number of contacts waiting in replacement caches.
    pub fn replacements_count(&self) -> usize {
        self.buckets().map(|bucket| bucket.replacements.len()).sum()
    }

    /// Iterate over all leaf buckets.
    pub fn buckets(&self) -> impl Iterator<Item = &KBucket> {
        self.nodes.iter().filter_map(|node| match node {
            TreeNode::Leaf(bucket) => Some(bucket),
            TreeNode::Branch(_) => None,
        })
    }

    /// Returns an iterator over the contacts in this routing table.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets().flat_map(|bucket| bucket.contacts.iter())
    }

    /// Returns the bucket covering `id`.
    pub fn bucket_for(&self, id: &Id) -> &KBucket {
        match &self.nodes[self.leaf_index(id)] {
            TreeNode::Leaf(bucket) => bucket,
            // leaf_index only ever returns leaves
            TreeNode::Branch(_) => unreachable!("leaf_index returned a branch"),
        }
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.bucket_for(id).get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    // === Public Methods ===

    /// Return up to `n` contacts closest to the target, closest first.
    pub fn find_closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut closest = ClosestContacts::new(*target);

        for contact in self.contacts() {
            closest.add(contact.clone());
        }

        closest.truncate(n);
        closest.into_vec()
    }

    /// Insert or refresh a contact.
    ///
    /// If its bucket is full and can't split, the contact is kept in the
    /// bucket's replacement cache, and the least recently seen contact of that
    /// bucket is queued for a liveness ping (see [Self::take_pending_pings]).
    pub fn note_contact(&mut self, contact: Contact, seen_alive: bool) -> NoteOutcome {
        if contact.id() == &self.id {
            return NoteOutcome::Ignored;
        }

        let mut contact = contact;
        contact.set_alive(seen_alive);

        loop {
            let index = self.leaf_index(contact.id());

            let (k, max_replacements) = (self.k, self.max_replacements);
            let can_split = self.can_split(index);

            let bucket = match &mut self.nodes[index] {
                TreeNode::Leaf(bucket) => bucket,
                TreeNode::Branch(_) => unreachable!("leaf_index returned a branch"),
            };

            if let Some(existing) = bucket.get_mut(contact.id()) {
                // Hearsay never overrides what we observed first hand.
                if seen_alive {
                    existing.merge(&contact);
                    bucket.touch(contact.id());
                }

                return NoteOutcome::Updated;
            }

            if bucket.contacts.len() < k {
                // Room in the bucket, prefer it over the replacement cache.
                bucket.remove_replacement(contact.id());

                if seen_alive {
                    bucket.last_refreshed = Instant::now();
                }

                trace!(contact = ?contact.id(), "Added contact to routing table");
                bucket.contacts.push(contact);

                return NoteOutcome::Added;
            }

            if can_split {
                self.split(index);
                continue;
            }

            bucket.add_replacement(contact, max_replacements);

            if seen_alive {
                if let Some(oldest) = bucket.contacts.first().cloned() {
                    if !self.pending_pings.iter().any(|c| c.id() == oldest.id()) {
                        self.pending_pings.push(oldest);
                    }
                }
            }

            return NoteOutcome::Replacement;
        }
    }

    /// Count a failed request to a contact.
    ///
    /// After [MAX_CONSECUTIVE_FAILURES](crate::common::MAX_CONSECUTIVE_FAILURES)
    /// the contact is evicted into the replacement cache and the freshest
    /// replacement takes its place.
    pub fn note_failure(&mut self, id: &Id) -> FailureOutcome {
        let index = self.leaf_index(id);
        let max_replacements = self.max_replacements;

        let bucket = match &mut self.nodes[index] {
            TreeNode::Leaf(bucket) => bucket,
            TreeNode::Branch(_) => unreachable!("leaf_index returned a branch"),
        };

        if let Some(replacement) = bucket.replacements.iter_mut().find(|c| c.id() == id) {
            return FailureOutcome::Counted(replacement.mark_failed());
        }

        let Some(position) = bucket.contacts.iter().position(|c| c.id() == id) else {
            return FailureOutcome::Unknown;
        };

        let failures = bucket.contacts[position].mark_failed();

        if !bucket.contacts[position].is_dead() {
            // Keep probing while someone is waiting for its seat.
            if !bucket.replacements.is_empty() {
                let contact = bucket.contacts[position].clone();

                if !self.pending_pings.iter().any(|c| c.id() == id) {
                    self.pending_pings.push(contact);
                }
            }

            return FailureOutcome::Counted(failures);
        }

        let evicted = bucket.contacts.remove(position);
        let promoted = bucket.promote_replacement();

        debug!(
            evicted = ?evicted.id(),
            promoted = ?promoted.as_ref().map(|c| *c.id()),
            "Evicted unresponsive contact"
        );

        bucket.add_replacement(evicted, max_replacements);

        FailureOutcome::Evicted { promoted }
    }

    /// Remove a contact from its bucket and replacement cache.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.leaf_index(id);

        match &mut self.nodes[index] {
            TreeNode::Leaf(bucket) => {
                bucket.remove_replacement(id);

                let position = bucket.contacts.iter().position(|c| c.id() == id)?;
                Some(bucket.contacts.remove(position))
            }
            TreeNode::Branch(_) => None,
        }
    }

    /// Drain the contacts that should be pinged to decide evictions.
    pub fn take_pending_pings(&mut self) -> Vec<Contact> {
        std::mem::take(&mut self.pending_pings)
    }

    /// Drop dead entries from all replacement caches, returns how many were purged.
    pub fn purge_dead_replacements(&mut self) -> usize {
        let mut purged = 0;

        for node in self.nodes.iter_mut() {
            if let TreeNode::Leaf(bucket) = node {
                let before = bucket.replacements.len();
                bucket.replacements.retain(|c| !c.is_dead());
                purged += before - bucket.replacements.len();
            }
        }

        purged
    }

    /// Returns a random Id inside each bucket that saw no live contact for `idle`.
    pub fn idle_bucket_targets(&self, now: Instant, idle: Duration) -> Vec<Id> {
        self.buckets()
            .filter(|bucket| now.saturating_duration_since(bucket.last_refreshed) >= idle)
            .map(|bucket| Id::random_with_prefix(&bucket.prefix, bucket.depth))
            .collect()
    }

    /// Mark the bucket covering `target` as freshly looked up.
    pub fn mark_refreshed(&mut self, target: &Id) {
        let index = self.leaf_index(target);

        if let TreeNode::Leaf(bucket) = &mut self.nodes[index] {
            bucket.last_refreshed = Instant::now();
        }
    }

    // === Private Methods ===

    fn leaf_index(&self, id: &Id) -> usize {
        let mut index = 0;
        let mut depth = 0;

        while let TreeNode::Branch(children) = &self.nodes[index] {
            index = children[id.bit(depth) as usize];
            depth += 1;
        }

        index
    }

    fn can_split(&self, index: usize) -> bool {
        match &self.nodes[index] {
            TreeNode::Leaf(bucket) => {
                bucket.depth < ID_BITS
                    && (bucket.contains_id(&self.id) || bucket.depth % self.split_factor != 0)
            }
            TreeNode::Branch(_) => false,
        }
    }

    fn split(&mut self, index: usize) {
        let bucket = match &mut self.nodes[index] {
            TreeNode::Leaf(bucket) => std::mem::replace(bucket, KBucket::new(self.id, 0)),
            TreeNode::Branch(_) => return,
        };

        let depth = bucket.depth;

        let mut children = [
            KBucket::new(bucket.prefix.with_bit(depth, false), depth + 1),
            KBucket::new(bucket.prefix.with_bit(depth, true), depth + 1),
        ];

        for contact in bucket.contacts {
            children[contact.id().bit(depth) as usize].contacts.push(contact);
        }
        for contact in bucket.replacements {
            children[contact.id().bit(depth) as usize]
                .replacements
                .push_back(contact);
        }
        for child in children.iter_mut() {
            child.last_refreshed = bucket.last_refreshed;
        }

        trace!(depth, "Split bucket");

        let [zero, one] = children;
        let first = self.nodes.len();

        self.nodes.push(TreeNode::Leaf(zero));
        self.nodes.push(TreeNode::Leaf(one));

        self.nodes[index] = TreeNode::Branch([first, first + 1]);
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bits shared by every Id in this bucket, only the first `depth` bits are meaningful.
    prefix: Id,
    depth: usize,
    /// Contacts in the k-bucket, sorted by the least recently seen.
    contacts: Vec<Contact>,
    /// Overflow candidates, oldest first.
    replacements: VecDeque<Contact>,
    last_refreshed: Instant,
}

impl KBucket {
    fn new(prefix: Id, depth: usize) -> Self {
        KBucket {
            prefix,
            depth,
            contacts: Vec::new(),
            replacements: VecDeque::new(),
            last_refreshed: Instant::now(),
        }
    }

    // === Getters ===

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn replacements(&self) -> impl Iterator<Item = &Contact> {
        self.replacements.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    /// Returns `true` if `id` falls in this bucket's range.
    pub fn contains_id(&self, id: &Id) -> bool {
        (0..self.depth).all(|index| id.bit(index) == self.prefix.bit(index))
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id() == id)
    }

    // === Private Methods ===

    fn get_mut(&mut self, id: &Id) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id() == id)
    }

    /// Move a contact to the most recently seen end.
    fn touch(&mut self, id: &Id) {
        if let Some(position) = self.contacts.iter().position(|c| c.id() == id) {
            let contact = self.contacts.remove(position);
            self.contacts.push(contact);
        }

        self.last_refreshed = Instant::now();
    }

    fn add_replacement(&mut self, contact: Contact, max_replacements: usize) {
        if max_replacements == 0 {
            return;
        }

        if !contact.is_dead() {
            if let Some(existing) = self.replacements.iter_mut().find(|c| c.id() == contact.id()) {
                existing.merge(&contact);
                return;
            }
        }

        self.remove_replacement(contact.id());

        while self.replacements.len() >= max_replacements {
            // Dead ones first, then the oldest.
            match self.replacements.iter().position(|c| c.is_dead()) {
                Some(position) => self.replacements.remove(position),
                None => self.replacements.pop_front(),
            };
        }

        if contact.is_dead() {
            // Dead entries never outrank live candidates.
            self.replacements.push_front(contact);
        } else {
            self.replacements.push_back(contact);
        }
    }

    fn remove_replacement(&mut self, id: &Id) {
        self.replacements.retain(|c| c.id() != id);
    }

    /// Move the freshest usable replacement into the bucket.
    fn promote_replacement(&mut self) -> Option<Contact> {
        let position = self
            .replacements
            .iter()
            .rposition(|c| c.is_alive())
            .or_else(|| self.replacements.iter().rposition(|c| !c.is_dead()))?;

        let contact = self.replacements.remove(position)?;
        self.contacts.push(contact.clone());

        Some(contact)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::str::FromStr;

    use super::*;

    fn contact_with_first_byte(byte: u8) -> Contact {
        let mut id = *Id::random().as_bytes();
        id[0] = byte;

        Contact::new(Id::from(id), Contact::random().address())
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.note_contact(Contact::random(), true);
        assert!(!table.is_empty());
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(Id::random());

        let contact = Contact::random();

        assert!(!table.contains(contact.id()));

        table.note_contact(contact.clone(), true);
        assert!(table.contains(contact.id()));

        table.remove(contact.id());
        assert!(!table.contains(contact.id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let contact1 = Contact::random();
        let contact2 = Contact::new(*contact1.id(), contact1.address());

        assert_eq!(table.note_contact(contact1, true), NoteOutcome::Added);
        assert_eq!(table.note_contact(contact2, true), NoteOutcome::Updated);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let contact = Contact::new(*table.id(), Contact::random().address());

        assert_eq!(table.note_contact(contact, true), NoteOutcome::Ignored);
        assert!(table.is_empty())
    }

    #[test]
    fn update_moves_to_most_recently_seen() {
        let mut table = RoutingTable::new(Id::random());

        let first = Contact::random();
        table.note_contact(first.clone(), true);
        table.note_contact(Contact::random(), true);

        table.note_contact(first.clone(), true);

        let bucket = table.bucket_for(first.id());
        assert_eq!(bucket.contacts().last().map(|c| *c.id()), Some(*first.id()));
    }

    #[test]
    fn splits_near_local_id() {
        let mut table = RoutingTable::new(Id::random()).with_bucket_size(4);

        for _ in 0..200 {
            table.note_contact(Contact::random(), true);
        }

        assert!(table.buckets().count() > 1);

        for bucket in table.buckets() {
            assert!(bucket.contacts().len() <= 4);

            for contact in bucket.contacts() {
                assert!(bucket.contains_id(contact.id()));
            }
        }
    }

    #[test]
    fn buckets_partition_the_id_space() {
        let mut table = RoutingTable::new(Id::random()).with_bucket_size(2);

        for _ in 0..100 {
            table.note_contact(Contact::random(), true);
        }

        for _ in 0..100 {
            let id = Id::random();
            let covering = table.buckets().filter(|b| b.contains_id(&id)).count();

            assert_eq!(covering, 1);
        }
    }

    #[test]
    fn bucket_capacity_invariant() {
        let mut table = RoutingTable::new(Id::random())
            .with_bucket_size(8)
            .with_split_factor(2)
            .with_max_replacements(3);

        for _ in 0..2000 {
            table.note_contact(Contact::random(), true);
        }

        for bucket in table.buckets() {
            assert!(bucket.contacts().len() <= 8);
            assert!(bucket.replacements().count() <= 3);
        }
    }

    #[test]
    fn far_buckets_do_not_split() {
        let local = Id::from([0; 20]);
        let mut table = RoutingTable::new(local)
            .with_bucket_size(4)
            .with_split_factor(1);

        for _ in 0..4 {
            table.note_contact(contact_with_first_byte(0x80), true);
        }

        let overflow = contact_with_first_byte(0x80);

        assert_eq!(
            table.note_contact(overflow.clone(), true),
            NoteOutcome::Replacement
        );
        assert_eq!(table.size(), 4);
        assert!(!table.contains(overflow.id()));
        assert_eq!(table.take_pending_pings().len(), 1);
    }

    #[test]
    fn replacement_on_failure() {
        let local = Id::from([0; 20]);
        let mut table = RoutingTable::new(local)
            .with_bucket_size(4)
            .with_split_factor(1);

        let mut members = vec![];
        for _ in 0..4 {
            let contact = contact_with_first_byte(0x80);
            table.note_contact(contact.clone(), true);
            members.push(contact);
        }

        let newcomer = contact_with_first_byte(0x80);
        table.note_contact(newcomer.clone(), true);

        let oldest = members[0].clone();

        for attempt in 1..=3 {
            let pings = table.take_pending_pings();
            assert_eq!(
                pings.iter().map(|c| *c.id()).collect::<Vec<_>>(),
                vec![*oldest.id()],
                "ping #{attempt}"
            );

            let outcome = table.note_failure(oldest.id());

            if attempt < 3 {
                assert_eq!(outcome, FailureOutcome::Counted(attempt));
            } else {
                assert_eq!(
                    outcome,
                    FailureOutcome::Evicted {
                        promoted: table.get(newcomer.id()).cloned()
                    }
                );
            }
        }

        assert!(table.contains(newcomer.id()));
        assert!(!table.contains(oldest.id()));

        let bucket = table.bucket_for(oldest.id());
        assert!(bucket.replacements().any(|c| c.id() == oldest.id()));

        assert_eq!(table.purge_dead_replacements(), 1);

        let bucket = table.bucket_for(oldest.id());
        assert!(!bucket.replacements().any(|c| c.id() == oldest.id()));
        assert_eq!(bucket.contacts().len(), 4);
    }

    #[test]
    fn replacement_overflow_drops_oldest() {
        let local = Id::from([0; 20]);
        let mut table = RoutingTable::new(local)
            .with_bucket_size(1)
            .with_split_factor(1)
            .with_max_replacements(2);

        table.note_contact(contact_with_first_byte(0x80), true);

        let first = contact_with_first_byte(0x80);
        let second = contact_with_first_byte(0x80);
        let third = contact_with_first_byte(0x80);

        table.note_contact(first.clone(), true);
        table.note_contact(second.clone(), true);
        table.note_contact(third.clone(), true);

        let ids: HashSet<Id> = table
            .bucket_for(first.id())
            .replacements()
            .map(|c| *c.id())
            .collect();

        assert_eq!(ids, [*second.id(), *third.id()].into_iter().collect());
    }

    #[test]
    fn find_closest_is_sorted_and_bounded() {
        let mut table = RoutingTable::new(Id::random());

        for _ in 0..300 {
            table.note_contact(Contact::random(), true);
        }

        let target = Id::random();
        let closest = table.find_closest(&target, 20);

        assert!(closest.len() <= 20);

        for pair in closest.windows(2) {
            assert!(pair[0].id().xor(&target) < pair[1].id().xor(&target));
        }

        for contact in &closest {
            assert!(table.contains(contact.id()));
        }
    }

    #[test]
    fn find_closest_matches_brute_force() {
        let local_id = Id::from_str("ba3042eb2d373b19e7c411ce6826e31b37be0b2e").unwrap();
        let mut table = RoutingTable::new(local_id);

        for _ in 0..100 {
            table.note_contact(Contact::random(), true);
        }

        let target = Id::random();

        let mut expected: Vec<Id> = table.contacts().map(|c| *c.id()).collect();
        expected.sort_by_key(|id| id.xor(&target));
        expected.truncate(10);

        let closest: Vec<Id> = table
            .find_closest(&target, 10)
            .iter()
            .map(|c| *c.id())
            .collect();

        assert_eq!(closest, expected);
    }

    #[test]
    fn idle_buckets() {
        let mut table = RoutingTable::new(Id::random());
        table.note_contact(Contact::random(), true);

        let now = Instant::now();
        assert!(table
            .idle_bucket_targets(now, Duration::from_secs(60))
            .is_empty());

        let later = now + Duration::from_secs(61);
        assert_eq!(
            table
                .idle_bucket_targets(later, Duration::from_secs(60))
                .len(),
            table.buckets().count()
        );
    }
}
