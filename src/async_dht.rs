//! AsyncDht node.

use bytes::Bytes;

use crate::{
    actor::{listener::Listener, GetOptions, Info, PutOptions},
    common::{Contact, Id, StoredValue},
    dht::{ActorMessage, Dht},
    error::{DhtGetError, DhtPutError, DhtRemoveError, DhtWasShutdown, SnapshotError},
    snapshot::Snapshot,
    OperationListener,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Wait until the integration lookup is done.
    ///
    /// Returns true if the routing table was populated.
    pub async fn integrate(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0.send(ActorMessage::Integrate(true, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub fn set_suspended(&self, suspended: bool) -> Result<(), DhtWasShutdown> {
        self.0.set_suspended(suspended)
    }

    /// Shutdown the actor thread loop.
    pub async fn destroy(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    // === Find nodes ===

    /// Dropping the future cancels the lookup.
    pub async fn lookup(&self, target: Id) -> Result<Vec<Contact>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Contact>>(1);

        self.0.send(ActorMessage::Lookup(target, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Values ===

    pub async fn put(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        options: PutOptions,
    ) -> Result<Id, DhtPutError> {
        self.put_with_listener(key, value, options, ()).await
    }

    pub async fn put_with_listener(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        options: PutOptions,
        listener: impl OperationListener + 'static,
    ) -> Result<Id, DhtPutError> {
        let receiver =
            self.0
                .start_put(key, value.into(), options, Listener::new(Box::new(listener)))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    /// Stream of the values stored under `key`, ending once the get completes.
    ///
    /// Dropping the stream cancels the get.
    pub fn get(
        &self,
        key: &[u8],
        options: GetOptions,
    ) -> Result<flume::r#async::RecvStream<'static, StoredValue>, DhtGetError> {
        self.get_with_listener(key, options, ())
    }

    pub fn get_with_listener(
        &self,
        key: &[u8],
        options: GetOptions,
        listener: impl OperationListener + 'static,
    ) -> Result<flume::r#async::RecvStream<'static, StoredValue>, DhtGetError> {
        let receiver = self
            .0
            .start_get(key, options, Listener::new(Box::new(listener)))?;

        Ok(receiver.into_stream())
    }

    pub async fn remove(&self, key: &[u8]) -> Result<usize, DhtRemoveError> {
        let receiver = self.0.start_remove(key, None, Listener::none())?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    // === Snapshots ===

    pub async fn export(&self, max: usize, include_values: bool) -> Result<Snapshot, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Snapshot>(1);

        self.0.send(ActorMessage::Export {
            max,
            include_values,
            sender,
        })?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    pub async fn import(&self, snapshot: Snapshot) -> Result<usize, SnapshotError> {
        let (sender, receiver) = flume::bounded::<Result<usize, SnapshotError>>(1);

        self.0
            .send(ActorMessage::Import(Box::new(snapshot), sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)?
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;

    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let testnet = Testnet::new(1).unwrap();
            let dht = Dht::builder()
                .testnet(&testnet)
                .build()
                .unwrap()
                .as_async();

            let a = dht.clone();

            dht.destroy().await;

            let result = a.lookup(Id::random()).await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .testnet(&testnet)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .testnet(&testnet)
                .build()
                .unwrap()
                .as_async();
            a.integrate().await.unwrap();
            b.integrate().await.unwrap();

            let key = a.put(b"hello", "world", PutOptions::default()).await.unwrap();

            let value = b
                .get(b"hello", GetOptions::default())
                .unwrap()
                .next()
                .await
                .expect("No values");

            assert_eq!(value.key(), &key);
            assert_eq!(value.payload(), &Bytes::from_static(b"world"));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn repeated_put() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .testnet(&testnet)
                .build()
                .unwrap()
                .as_async();
            a.integrate().await.unwrap();

            let first = a.put(b"same", "value", PutOptions::default());
            let second = a.put(b"same", "value", PutOptions::default());

            assert_eq!(first.await.unwrap(), second.await.unwrap());
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn export_import() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .testnet(&testnet)
                .build()
                .unwrap()
                .as_async();
            a.integrate().await.unwrap();

            let snapshot = a.export(100, false).await.unwrap();
            assert!(snapshot.contacts_count() > 0);

            let fresh = Dht::builder()
                .memory_network(testnet.memory_network())
                .build()
                .unwrap()
                .as_async();

            let added = fresh.import(snapshot).await.unwrap();
            assert!(added > 0);
            assert!(fresh.integrate().await.unwrap());
        }

        futures::executor::block_on(test());
    }
}
