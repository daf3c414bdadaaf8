use std::net::SocketAddr;

use crate::Id;

use super::Actor;

/// Information and statistics about this Dht node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    network: u8,
    local_addr: SocketAddr,
    routing_table_size: usize,
    replacements: usize,
    keys: usize,
    values: usize,
    active_operations: usize,
    suspended: bool,
    integrated: bool,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Id of the logical network this node belongs to.
    pub fn network(&self) -> u8 {
        self.network
    }

    /// Address other nodes reach this node at.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of contacts in the routing table buckets.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of contacts waiting in replacement caches.
    pub fn replacements(&self) -> usize {
        self.replacements
    }

    /// Number of keys in the local store.
    pub fn keys(&self) -> usize {
        self.keys
    }

    /// Number of values in the local store, ours and others'.
    pub fn values(&self) -> usize {
        self.values
    }

    /// Operations running or queued.
    pub fn active_operations(&self) -> usize {
        self.active_operations
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    /// Returns `true` once an integration lookup populated the routing table.
    pub fn integrated(&self) -> bool {
        self.integrated
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        Self {
            id: *actor.id(),
            network: actor.config().network,
            local_addr: actor.local_contact().address(),
            routing_table_size: actor.routing_table().size(),
            replacements: actor.routing_table().replacements_count(),
            keys: actor.store().keys_count(),
            values: actor.store().values_count(),
            active_operations: actor.active_operations(),
            suspended: actor.is_suspended(),
            integrated: actor.is_integrated(),
        }
    }
}
