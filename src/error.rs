//! Main Crate Errors

use crate::common::MAX_VALUE_SIZE;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The actor thread of a [Dht](crate::Dht) is no longer running.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Put errors
pub enum PutError {
    /// Keys must be non empty, and exactly 20 bytes when key encoding is disabled.
    #[error("Malformed key")]
    MalformedKey,

    #[error("Value must not be empty")]
    EmptyValue,

    #[error("Value of {0} bytes exceeds the maximum of {MAX_VALUE_SIZE} bytes")]
    ValueTooLarge(usize),

    /// The storage adapter declined the key, usually for lack of space.
    #[error("Storage adapter rejected the key")]
    Rejected,

    #[error("Key is blocked")]
    Blocked,

    /// Failed to find any nodes close, usually means the node failed to integrate,
    /// so the routing table is empty.
    #[error("Failed to find any nodes close to store value at")]
    NoClosestNodes,

    /// None of the closest nodes replied in time.
    #[error("Put query timed out")]
    Timeout,

    /// Some nodes stored the value, but fewer than the configured quorum.
    #[error("Stored at {stored_at} nodes, quorum is {quorum}")]
    QuorumNotReached { stored_at: usize, quorum: usize },

    /// The listener refused to follow a diversification.
    #[error("Put cancelled on diversification")]
    Cancelled,

    /// The key is diversified beyond the configured depth.
    #[error("Key is diversified too deeply")]
    OverDiversified,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Get errors
pub enum GetError {
    #[error("Malformed key")]
    MalformedKey,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Remove errors
pub enum RemoveError {
    #[error("Malformed key")]
    MalformedKey,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Put errors of a [Dht](crate::Dht) handle.
pub enum DhtPutError {
    #[error(transparent)]
    PutError(#[from] PutError),

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Get errors of a [Dht](crate::Dht) handle.
pub enum DhtGetError {
    #[error(transparent)]
    GetError(#[from] GetError),

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Remove errors of a [Dht](crate::Dht) handle.
pub enum DhtRemoveError {
    #[error(transparent)]
    RemoveError(#[from] RemoveError),

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug)]
/// Errors exporting or importing a [Snapshot](crate::Snapshot).
pub enum SnapshotError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse snapshot bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    /// The contact list doesn't match its checksum, the snapshot is truncated or corrupt.
    #[error("Snapshot checksum mismatch")]
    ChecksumMismatch,

    #[error("Snapshot of network {found} can't be imported into network {expected}")]
    NetworkMismatch { expected: u8, found: u8 },

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug)]
/// Errors building a [Dht](crate::Dht).
pub enum BuildError {
    /// Neither a transport nor a memory network was given.
    #[error("A transport is required")]
    MissingTransport,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
