#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod core;

mod actor;
pub mod adapter;
#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
pub mod snapshot;
pub mod transport;

pub use crate::common::{
    Contact, ContactFlags, DiversificationType, FailureOutcome, Id, KBucket, NoteOutcome,
    ReplicationControl, RoutingTable, StoredValue, ValueFlags, ID_SIZE, MAX_VALUE_SIZE,
};
pub use actor::{
    config::{Config, Quorum},
    listener::{ChannelListener, OperationEvent, OperationListener},
    GetOptions, Info, PutOptions,
};
pub use adapter::{MemoryStorageAdapter, NatPuncher, StorageAdapter};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, GetResponse, Testnet};
pub use snapshot::Snapshot;
pub use transport::{MemoryNetwork, Transport, TransportEvent};

pub mod error;
