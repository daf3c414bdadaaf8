//! Answers requests from remote nodes.

use std::time::Instant;

use tracing::debug;

use crate::common::{
    messages::{
        ErrorCode, ErrorReply, FindNodeRequestArguments, FindValueRequestArguments,
        NodesReplyArguments, RemoveRequestArguments, RemovedReplyArguments,
        StoreRequestArguments, StoredReplyArguments, ValuesReplyArguments,
    },
    Contact, DiversificationType, Id, Reply, Request, RoutingTable, MAX_VALUE_SIZE,
};
use crate::core::store::{LocalStore, StoreError};
use crate::core::tokens::Tokens;

/// Maximum number of values returned in a single reply.
pub const MAX_VALUES_PER_REPLY: usize = 32;

#[derive(Debug, Default)]
/// A server that handles incoming requests against the local store.
pub struct Server {
    /// Tokens generator
    tokens: Tokens,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reply to send back to the requester.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        store: &mut LocalStore,
        from: &Contact,
        request: Request,
    ) -> Reply {
        // Lazily rotate secrets before handling a request
        if self.tokens.should_update() {
            self.tokens.rotate()
        }

        match request {
            Request::Ping => Reply::Pong,
            Request::FindNode(FindNodeRequestArguments { target }) => {
                Reply::Nodes(NodesReplyArguments {
                    contacts: closest(routing_table, from, &target),
                    token: self.tokens.generate_token(from.address()),
                    diversification: DiversificationType::None,
                })
            }
            Request::FindValue(FindValueRequestArguments {
                key,
                max_values,
                target,
                ..
            }) => {
                let adapter = store.adapter().clone();
                let token = self.tokens.generate_token(from.address());
                let diversification = adapter.local_diversification(&key);

                let max_values = match max_values as usize {
                    0 => MAX_VALUES_PER_REPLY,
                    n => n.min(MAX_VALUES_PER_REPLY),
                };

                let values = if adapter.is_key_blocked(&key) {
                    Vec::new()
                } else {
                    store.get(&key, max_values)
                };

                if values.is_empty() {
                    return Reply::Nodes(NodesReplyArguments {
                        contacts: closest(routing_table, from, &target),
                        token,
                        diversification,
                    });
                }

                adapter.key_read(&key, from);

                Reply::Values(ValuesReplyArguments {
                    values,
                    token,
                    diversification,
                })
            }
            Request::Store(StoreRequestArguments { token, key, values }) => {
                if !self.tokens.validate(from.address(), &token) {
                    debug!(?key, requester = ?from.id(), request_type = "store", "Invalid token");

                    return Reply::Error(ErrorReply::new(ErrorCode::InvalidToken, "Bad token"));
                }

                if let Some(value) = values
                    .iter()
                    .find(|v| v.key() != &key || v.size() == 0 || v.size() > MAX_VALUE_SIZE)
                {
                    debug!(?key, requester = ?from.id(), size = value.size(), "Invalid value");

                    return Reply::Error(ErrorReply::new(ErrorCode::Protocol, "Invalid value"));
                }

                let adapter = store.adapter().clone();

                if adapter.is_key_blocked(&key) {
                    return Reply::Error(ErrorReply::new(ErrorCode::Blocked, "Key blocked"));
                }

                let diversification = adapter.local_diversification(&key);
                if !diversification.is_none() {
                    debug!(?key, ?diversification, "Refused store on diversified key");

                    return Reply::Stored(StoredReplyArguments { diversification });
                }

                let now = Instant::now();

                for mut value in values {
                    value.local = false;

                    match store.put_at(value, now) {
                        Ok(_) => {}
                        Err(StoreError::Full) => {
                            return Reply::Stored(StoredReplyArguments {
                                diversification: DiversificationType::Size,
                            });
                        }
                        Err(StoreError::Blocked) => {
                            return Reply::Error(ErrorReply::new(
                                ErrorCode::Blocked,
                                "Key blocked",
                            ));
                        }
                        Err(StoreError::Rejected) => {
                            return Reply::Error(ErrorReply::new(
                                ErrorCode::Rejected,
                                "Key rejected",
                            ));
                        }
                    }
                }

                Reply::Stored(StoredReplyArguments {
                    diversification: adapter.local_diversification(&key),
                })
            }
            Request::Remove(RemoveRequestArguments { token, key }) => {
                if !self.tokens.validate(from.address(), &token) {
                    debug!(?key, requester = ?from.id(), request_type = "remove", "Invalid token");

                    return Reply::Error(ErrorReply::new(ErrorCode::InvalidToken, "Bad token"));
                }

                Reply::Removed(RemovedReplyArguments {
                    count: store.remove(&key, Some(from.id())),
                })
            }
        }
    }
}

fn closest(routing_table: &RoutingTable, from: &Contact, target: &Id) -> Vec<Contact> {
    let mut contacts = routing_table.find_closest(target, routing_table.bucket_size() + 1);

    contacts.retain(|contact| contact.id() != from.id());
    contacts.truncate(routing_table.bucket_size());

    contacts
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::adapter::{MemoryStorageAdapter, StorageAdapter};
    use crate::common::{StoredValue, Token};

    struct Fixture {
        server: Server,
        table: RoutingTable,
        store: LocalStore,
        adapter: Arc<MemoryStorageAdapter>,
        requester: Contact,
    }

    impl Fixture {
        fn new() -> Self {
            let adapter = Arc::new(MemoryStorageAdapter::new());

            Fixture {
                server: Server::new(),
                table: RoutingTable::new(Id::random()),
                store: LocalStore::new(adapter.clone(), Duration::from_secs(8 * 60 * 60)),
                adapter,
                requester: Contact::unique(6881),
            }
        }

        fn handle(&mut self, request: Request) -> Reply {
            let requester = self.requester.clone();
            self.server
                .handle_request(&self.table, &mut self.store, &requester, request)
        }

        fn token(&mut self, key: Id) -> Token {
            let reply = self.handle(Request::FindNode(FindNodeRequestArguments { target: key }));
            reply.token().unwrap()
        }

        fn store(&mut self, key: Id, payload: &'static [u8]) -> Reply {
            let token = self.token(key);
            let value =
                StoredValue::new(key, Bytes::from_static(payload), self.requester.clone());

            self.handle(Request::Store(StoreRequestArguments {
                token,
                key,
                values: vec![value],
            }))
        }

        fn find_value(&mut self, key: Id) -> Reply {
            self.handle(Request::FindValue(FindValueRequestArguments {
                key,
                flags: Default::default(),
                max_values: 0,
                target: key,
            }))
        }
    }

    #[test]
    fn store_then_find_value() {
        let mut fixture = Fixture::new();
        let key = Id::random();

        assert!(matches!(fixture.find_value(key), Reply::Nodes(_)));

        match fixture.store(key, b"hello") {
            Reply::Stored(StoredReplyArguments { diversification }) => {
                assert!(diversification.is_none())
            }
            reply => panic!("unexpected {reply:?}"),
        }

        match fixture.find_value(key) {
            Reply::Values(ValuesReplyArguments { values, .. }) => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].payload().as_ref(), b"hello");
                assert!(!values[0].is_local());
            }
            reply => panic!("unexpected {reply:?}"),
        }
    }

    #[test]
    fn store_with_bad_token() {
        let mut fixture = Fixture::new();
        let key = Id::random();

        let reply = fixture.handle(Request::Store(StoreRequestArguments {
            token: [0; 4],
            key,
            values: vec![StoredValue::new(
                key,
                Bytes::from_static(b"v"),
                fixture.requester.clone(),
            )],
        }));

        match reply {
            Reply::Error(error) => assert_eq!(error.code, ErrorCode::InvalidToken),
            reply => panic!("unexpected {reply:?}"),
        }
    }

    #[test]
    fn store_for_another_key_is_invalid() {
        let mut fixture = Fixture::new();
        let key = Id::random();
        let token = fixture.token(key);

        let reply = fixture.handle(Request::Store(StoreRequestArguments {
            token,
            key,
            values: vec![StoredValue::new(
                Id::random(),
                Bytes::from_static(b"v"),
                fixture.requester.clone(),
            )],
        }));

        assert!(matches!(reply, Reply::Error(ErrorReply { code: ErrorCode::Protocol, .. })));
    }

    #[test]
    fn diversified_key_redirects_writers() {
        let mut fixture = Fixture::new();
        let key = Id::random();

        // Make the key oversized from the adapter's point of view.
        fixture.adapter.key_created(&key, false);
        for _ in 0..65 {
            fixture.adapter.value_added(
                &key,
                &StoredValue::new(key, Bytes::from(vec![0; 512]), Contact::random()),
            );
        }

        match fixture.store(key, b"v") {
            Reply::Stored(StoredReplyArguments { diversification }) => {
                assert_eq!(diversification, DiversificationType::Size)
            }
            reply => panic!("unexpected {reply:?}"),
        }

        assert!(fixture.store.get(&key, 0).is_empty());
    }

    #[test]
    fn full_store_replies_size_diversification() {
        let mut fixture = Fixture::new();
        fixture.store = LocalStore::new(fixture.adapter.clone(), Duration::from_secs(60))
            .with_max_remote_size(4);

        match fixture.store(Id::random(), b"too large") {
            Reply::Stored(StoredReplyArguments { diversification }) => {
                assert_eq!(diversification, DiversificationType::Size)
            }
            reply => panic!("unexpected {reply:?}"),
        }
    }

    #[test]
    fn remove_only_own_values() {
        let mut fixture = Fixture::new();
        let key = Id::random();

        fixture.store(key, b"mine");

        let someone_else = Contact::unique(7000);
        let other = StoredValue::new(key, Bytes::from_static(b"theirs"), someone_else)
            .with_flags(crate::common::ValueFlags::MULTI_VALUE);
        fixture.store.put(other).unwrap();

        let token = fixture.token(key);

        match fixture.handle(Request::Remove(RemoveRequestArguments { token, key })) {
            Reply::Removed(RemovedReplyArguments { count }) => assert_eq!(count, 1),
            reply => panic!("unexpected {reply:?}"),
        }

        let left = fixture.store.get(&key, 0);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload().as_ref(), b"theirs");
    }

    #[test]
    fn find_node_excludes_requester() {
        let mut fixture = Fixture::new();
        let requester = fixture.requester.clone();

        fixture.table.note_contact(requester.clone(), true);
        fixture.table.note_contact(Contact::unique(1), true);

        match fixture.handle(Request::FindNode(FindNodeRequestArguments {
            target: *requester.id(),
        })) {
            Reply::Nodes(NodesReplyArguments { contacts, .. }) => {
                assert_eq!(contacts.len(), 1);
                assert!(!contacts.iter().any(|c| c.id() == requester.id()));
            }
            reply => panic!("unexpected {reply:?}"),
        }
    }
}
