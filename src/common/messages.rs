//! Structured requests and replies exchanged through a [Transport](crate::transport::Transport).
//!
//! Encoding these to bytes is the transport's business; the DHT only ever
//! reasons about these types.

use crate::common::{Contact, DiversificationType, Id, StoredValue, ValueFlags};

/// Write token proving the requester recently asked us for closer nodes
/// from the same IP.
pub type Token = [u8; 4];

#[derive(Debug, Clone)]
pub enum Request {
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
    Remove(RemoveRequestArguments),
}

#[derive(Debug, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
    pub flags: ValueFlags,
    pub max_values: u16,
    /// Lookup target used for routing, differs from `key` for obfuscated lookups.
    pub target: Id,
}

#[derive(Debug, Clone)]
pub struct StoreRequestArguments {
    pub token: Token,
    pub key: Id,
    pub values: Vec<StoredValue>,
}

#[derive(Debug, Clone)]
pub struct RemoveRequestArguments {
    pub token: Token,
    pub key: Id,
}

impl Request {
    /// Returns the Id this request is about, if any.
    pub fn target(&self) -> Option<&Id> {
        match self {
            Request::Ping => None,
            Request::FindNode(FindNodeRequestArguments { target }) => Some(target),
            Request::FindValue(FindValueRequestArguments { target, .. }) => Some(target),
            Request::Store(StoreRequestArguments { key, .. }) => Some(key),
            Request::Remove(RemoveRequestArguments { key, .. }) => Some(key),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Pong,
    /// Closer contacts to the requested target.
    Nodes(NodesReplyArguments),
    /// Values stored at the requested key.
    Values(ValuesReplyArguments),
    /// Outcome of a [Request::Store].
    Stored(StoredReplyArguments),
    /// Outcome of a [Request::Remove].
    Removed(RemovedReplyArguments),
    Error(ErrorReply),
}

#[derive(Debug, Clone)]
pub struct NodesReplyArguments {
    pub contacts: Vec<Contact>,
    pub token: Token,
    pub diversification: DiversificationType,
}

#[derive(Debug, Clone)]
pub struct ValuesReplyArguments {
    pub values: Vec<StoredValue>,
    pub token: Token,
    pub diversification: DiversificationType,
}

#[derive(Debug, Clone)]
pub struct StoredReplyArguments {
    /// Anything but [DiversificationType::None] means the store was refused
    /// and the publisher should diversify.
    pub diversification: DiversificationType,
}

#[derive(Debug, Clone)]
pub struct RemovedReplyArguments {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Token missing, expired or issued to another IP.
    InvalidToken,
    /// The request is malformed or exceeds limits.
    Protocol,
    /// The storage policy refused the key.
    Rejected,
    /// The key is blocked by the storage policy.
    Blocked,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        ErrorReply {
            code,
            description: description.into(),
        }
    }
}

impl Reply {
    /// Write token carried by this reply, if any.
    pub fn token(&self) -> Option<Token> {
        match self {
            Reply::Nodes(NodesReplyArguments { token, .. }) => Some(*token),
            Reply::Values(ValuesReplyArguments { token, .. }) => Some(*token),
            _ => None,
        }
    }
}
