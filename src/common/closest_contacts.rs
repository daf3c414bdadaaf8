use std::cmp::Ordering;

use crate::common::{Contact, Id};

#[derive(Debug, Clone)]
/// Contacts sorted by XOR distance to a target, without duplicate Ids.
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(64),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_ok()
    }

    /// Returns the contact at `index` closest position.
    pub fn get(&self, index: usize) -> Option<&Contact> {
        self.contacts.get(index)
    }

    // === Public Methods ===

    /// Insert a contact at its sorted position, returns `false` if its Id is already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        match self.position(contact.id()) {
            Ok(_) => false,
            Err(pos) => {
                self.contacts.insert(pos, contact);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        self.position(id).ok().map(|pos| self.contacts.remove(pos))
    }

    /// Keep only the `n` closest contacts.
    pub fn truncate(&mut self, n: usize) {
        self.contacts.truncate(n)
    }

    /// Returns `true` if `id` is closer to the target than the contact at
    /// `index`, or if there are fewer than `index + 1` contacts.
    pub fn is_closer_than_nth(&self, id: &Id, index: usize) -> bool {
        match self.contacts.get(index) {
            Some(nth) => id.xor(&self.target) < nth.id().xor(&self.target),
            None => true,
        }
    }

    pub fn into_vec(self) -> Vec<Contact> {
        self.contacts
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Result<usize, usize> {
        let seek = id.xor(&self.target);

        self.contacts.binary_search_by(|probe| {
            if probe.id() == id {
                Ordering::Equal
            } else {
                probe.id().xor(&self.target).cmp(&seek)
            }
        })
    }
}

impl IntoIterator for ClosestContacts {
    type Item = Contact;
    type IntoIter = std::vec::IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}
