//! Per operation progress callbacks.

use flume::{Receiver, Sender};

use crate::common::{Contact, Id, StoredValue};

/// Progress of a put, get or remove.
///
/// Callbacks run on the actor thread and must return quickly. Events of
/// different contacts may interleave, but [Self::complete] is always called
/// exactly once, last.
pub trait OperationListener: Send {
    /// A lookup round sent new requests.
    fn searching(&mut self, _key: &Id, _contacted: usize, _active: usize) {}

    /// `key` is redirected to `keys`. Returning `false` cancels the operation.
    fn diversified(&mut self, _key: &Id, _keys: &[Id]) -> bool {
        true
    }

    /// A contact replied during a lookup, `closest` if it is among the final closest set.
    fn found(&mut self, _contact: &Contact, _closest: bool) {}

    /// A value was read from a contact.
    fn read(&mut self, _contact: &Contact, _value: &StoredValue) {}

    /// A contact stored or removed a value.
    fn wrote(&mut self, _contact: &Contact, _value: Option<&StoredValue>) {}

    /// The operation is over.
    fn complete(&mut self, _timed_out: bool) {}
}

/// Ignores every event.
impl OperationListener for () {}

#[derive(Debug, Clone)]
/// An [OperationListener] callback as a value.
pub enum OperationEvent {
    Searching {
        key: Id,
        contacted: usize,
        active: usize,
    },
    Diversified {
        key: Id,
        keys: Vec<Id>,
    },
    Found {
        contact: Contact,
        closest: bool,
    },
    Read {
        contact: Contact,
        value: StoredValue,
    },
    Wrote {
        contact: Contact,
        value: Option<StoredValue>,
    },
    Complete {
        timed_out: bool,
    },
}

#[derive(Debug)]
/// [OperationListener] forwarding events to a channel, accepting every diversification.
pub struct ChannelListener {
    sender: Sender<OperationEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<OperationEvent>) {
        let (sender, receiver) = flume::unbounded();

        (ChannelListener { sender }, receiver)
    }

    fn send(&self, event: OperationEvent) {
        let _ = self.sender.send(event);
    }
}

impl OperationListener for ChannelListener {
    fn searching(&mut self, key: &Id, contacted: usize, active: usize) {
        self.send(OperationEvent::Searching {
            key: *key,
            contacted,
            active,
        })
    }

    fn diversified(&mut self, key: &Id, keys: &[Id]) -> bool {
        self.send(OperationEvent::Diversified {
            key: *key,
            keys: keys.to_vec(),
        });

        true
    }

    fn found(&mut self, contact: &Contact, closest: bool) {
        self.send(OperationEvent::Found {
            contact: contact.clone(),
            closest,
        })
    }

    fn read(&mut self, contact: &Contact, value: &StoredValue) {
        self.send(OperationEvent::Read {
            contact: contact.clone(),
            value: value.clone(),
        })
    }

    fn wrote(&mut self, contact: &Contact, value: Option<&StoredValue>) {
        self.send(OperationEvent::Wrote {
            contact: contact.clone(),
            value: value.cloned(),
        })
    }

    fn complete(&mut self, timed_out: bool) {
        self.send(OperationEvent::Complete { timed_out })
    }
}

/// Owns a user listener and guarantees a single, final `complete`.
pub(crate) struct Listener {
    inner: Box<dyn OperationListener>,
    completed: bool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("completed", &self.completed)
            .finish()
    }
}

impl Listener {
    pub fn new(inner: Box<dyn OperationListener>) -> Self {
        Listener {
            inner,
            completed: false,
        }
    }

    pub fn none() -> Self {
        Self::new(Box::new(()))
    }

    pub fn searching(&mut self, key: &Id, contacted: usize, active: usize) {
        if !self.completed {
            self.inner.searching(key, contacted, active)
        }
    }

    pub fn diversified(&mut self, key: &Id, keys: &[Id]) -> bool {
        !self.completed && self.inner.diversified(key, keys)
    }

    pub fn found(&mut self, contact: &Contact, closest: bool) {
        if !self.completed {
            self.inner.found(contact, closest)
        }
    }

    pub fn read(&mut self, contact: &Contact, value: &StoredValue) {
        if !self.completed {
            self.inner.read(contact, value)
        }
    }

    pub fn wrote(&mut self, contact: &Contact, value: Option<&StoredValue>) {
        if !self.completed {
            self.inner.wrote(contact, value)
        }
    }

    pub fn complete(&mut self, timed_out: bool) {
        if !self.completed {
            self.completed = true;
            self.inner.complete(timed_out)
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.complete(false)
    }
}
