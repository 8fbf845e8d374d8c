//! Durable outbox through queue hooks.
//!
//! [`Persistence`] mirrors every state transition of a [`Queue`] into a
//! [`Collection`] and restores the queue from it on first access, so that
//! messages queued before a restart are sent (and retried) afterwards.
//!
//! ## Components
//!
//! - [`Collection`]: Storage capability (`load`, `add`, `remove`, `update`)
//! - [`Persistence`]: Queue hook binding a collection to a queue
//! - [`persisting`]: Builder installing persistence on an outbox
//!
//! Concrete collections are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).
//!
//! [`Queue`]: crate::queue::Queue

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{
    Message,
    processor::MessageQueue,
    queue::{Members, QueueHook},
};

/// Key under which the storage id of a persisted message is kept in
/// [`Message::private`].
pub const STORAGE_ID: &str = "storage_id";

/// A stored message together with the id its collection assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub storage_id: String,
    pub message: Message,
}

/// Storage backend for queued messages.
///
/// Storage ids are chosen by the collection and are opaque to the queue.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Every stored message.
    async fn load(&self) -> Result<Vec<Record>, Self::Error>;

    /// Store a message and return its storage id.
    async fn add(&self, message: &Message) -> Result<String, Self::Error>;

    async fn remove(&self, storage_id: &str) -> Result<(), Self::Error>;

    /// Overwrite the stored copy.
    async fn update(&self, storage_id: &str, message: &Message) -> Result<(), Self::Error>;
}

/// Install persistence on the outbox of a message queue.
pub fn persisting<S, C>(mq: MessageQueue<S>, collection: C) -> MessageQueue<S>
where
    C: Collection + 'static,
{
    mq.with_outbox_hook(Persistence::new(collection))
}

/// Error returned by persistence hooks.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    kind: StoreErrorKind,
}

/// Persistence error kinds.
#[derive(Debug)]
pub enum StoreErrorKind {
    /// The collection failed.
    Collection(tower::BoxError),
    /// A queued message carries no storage id.
    MissingStorageId(String),
}

impl StoreError {
    fn collection(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Collection(err.into()),
        }
    }

    fn missing_storage_id(id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::MissingStorageId(id.to_owned()),
        }
    }

    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StoreErrorKind::Collection(err) => writeln!(f, "Collection error: {err}"),
            StoreErrorKind::MissingStorageId(id) => {
                writeln!(f, "Message {id} has no storage id")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StoreErrorKind::Collection(err) => Some(err.as_ref()),
            StoreErrorKind::MissingStorageId(_) => None,
        }
    }
}

/// Queue hook mirroring queue state into a [`Collection`].
///
/// The collection is loaded once, right before the first operation that
/// reads or changes the queue. A failed load is retried on the next access.
pub struct Persistence<C> {
    collection: C,
    loaded: AtomicBool,
}

impl<C> Persistence<C>
where
    C: Collection,
{
    pub fn new(collection: C) -> Self {
        Self {
            collection,
            loaded: AtomicBool::new(false),
        }
    }

    #[instrument(skip_all)]
    async fn hydrate(&self, members: &mut Members) -> Result<(), StoreError> {
        // hooks run under the queue lock, no concurrent hydration
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let records = self.collection.load().await.map_err(StoreError::collection)?;
        let count = records.len();
        for Record {
            storage_id,
            mut message,
        } in records
        {
            if members.contains(message.id()) {
                tracing::warn!(id = message.id(), "Stored message already queued, skipping");
                continue;
            }
            message
                .private
                .insert(STORAGE_ID.to_owned(), Value::String(storage_id));
            members.insert(message);
        }

        self.loaded.store(true, Ordering::Release);
        tracing::debug!(count, "Queue restored from storage");
        Ok(())
    }
}

fn storage_id(message: &Message) -> Result<&str, StoreError> {
    message
        .private
        .get(STORAGE_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::missing_storage_id(message.id()))
}

#[async_trait]
impl<C> QueueHook for Persistence<C>
where
    C: Collection,
{
    async fn before_add(
        &self,
        members: &mut Members,
        _message: &mut Message,
    ) -> Result<(), tower::BoxError> {
        Ok(self.hydrate(members).await?)
    }

    async fn after_add(&self, message: &mut Message) -> Result<(), tower::BoxError> {
        let storage_id = self
            .collection
            .add(message)
            .await
            .map_err(StoreError::collection)?;
        message
            .private
            .insert(STORAGE_ID.to_owned(), Value::String(storage_id));
        Ok(())
    }

    async fn before_remove(&self, members: &mut Members, _id: &str) -> Result<(), tower::BoxError> {
        Ok(self.hydrate(members).await?)
    }

    async fn after_remove(&self, message: &Message) -> Result<(), tower::BoxError> {
        self.collection
            .remove(storage_id(message)?)
            .await
            .map_err(StoreError::collection)?;
        Ok(())
    }

    async fn before_defer(
        &self,
        members: &mut Members,
        _message: &mut Message,
    ) -> Result<(), tower::BoxError> {
        Ok(self.hydrate(members).await?)
    }

    async fn after_defer(&self, message: &Message) -> Result<(), tower::BoxError> {
        self.collection
            .update(storage_id(message)?, message)
            .await
            .map_err(StoreError::collection)?;
        Ok(())
    }

    async fn before_get(&self, members: &mut Members) -> Result<(), tower::BoxError> {
        Ok(self.hydrate(members).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        clock::ManualClock,
        message::{ACK, LAST, SENT},
        processor::Outcome,
        qos::{AckConfig, acknowledging},
        queue::{Queue, QueueErrorKind},
        store::inmemory::{InMemoryCollection, Operation},
        transport::{InMemory, Transport},
    };

    fn queue(collection: &InMemoryCollection, clock: &ManualClock) -> Queue {
        Queue::new("outbox")
            .with_clock(Arc::new(clock.clone()))
            .with_hook(Persistence::new(collection.clone()))
    }

    #[tokio::test]
    async fn mirrors_add_and_remove() {
        let collection = InMemoryCollection::default();
        let queue = queue(&collection, &ManualClock::new(100));

        queue
            .add(Message::with_id("m-1", "dest", "payload"))
            .await
            .unwrap();
        let stored = queue.get("m-1").await.unwrap();
        assert_eq!(stored.private.get(STORAGE_ID), Some(&Value::from("1")));
        queue.remove("m-1").await.unwrap();

        let changelog = collection.changelog().await;
        assert_eq!(changelog.len(), 3);
        assert_eq!(changelog[0], Operation::Load);
        assert!(matches!(
            &changelog[1],
            Operation::Add(id, message) if id == "1" && message.id() == "m-1" && message.last() == 100
        ));
        assert_eq!(changelog[2], Operation::Remove("1".into()));
        assert!(collection.records().await.is_empty());
    }

    #[tokio::test]
    async fn loads_lazily_and_once() {
        let collection = InMemoryCollection::default();
        let queue = queue(&collection, &ManualClock::new(0));

        assert_eq!(queue.len().await, 0);
        assert!(collection.changelog().await.is_empty());

        queue.peek_next().await.unwrap();
        queue.peek_next().await.unwrap();
        queue.add(Message::with_id("a", "dest", "x")).await.unwrap();

        let loads = collection
            .changelog()
            .await
            .into_iter()
            .filter(|op| *op == Operation::Load)
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn restores_members_in_stored_order() {
        let collection = InMemoryCollection::default();
        collection
            .add(&Message::with_id("late", "dest", "b").tagged(LAST, 5_000))
            .await
            .unwrap();
        collection
            .add(&Message::with_id("early", "dest", "a").tagged(LAST, 4_000))
            .await
            .unwrap();
        let queue = queue(&collection, &ManualClock::new(1_000));

        let next = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(next.id(), "early");
        assert_eq!(next.private.get(STORAGE_ID), Some(&Value::from("2")));
        assert_eq!(queue.len().await, 2);

        // stamps continue above the restored ones even with a lagging clock
        queue.add(Message::with_id("new", "dest", "c")).await.unwrap();
        assert!(queue.get("new").await.unwrap().last() > 5_000);
    }

    #[tokio::test]
    async fn defer_updates_the_stored_copy() {
        let collection = InMemoryCollection::default();
        let clock = ManualClock::new(10);
        let queue = queue(&collection, &clock);
        queue.add(Message::with_id("m", "dest", "x")).await.unwrap();

        let mut message = queue.peek_next().await.unwrap().unwrap();
        message.tags.insert(SENT.into(), 10.into());
        clock.advance(5);
        queue.defer(message).await.unwrap();

        let records = collection.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].storage_id, "1");
        assert_eq!(records[0].message.tag_u64(SENT), Some(10));
        assert_eq!(records[0].message.last(), 15);
        assert!(matches!(
            collection.changelog().await.last(),
            Some(Operation::Update(id, _)) if id == "1"
        ));
    }

    struct Unavailable;

    #[async_trait]
    impl Collection for Unavailable {
        type Error = tower::BoxError;

        async fn load(&self) -> Result<Vec<Record>, Self::Error> {
            Ok(Vec::new())
        }

        async fn add(&self, _: &Message) -> Result<String, Self::Error> {
            Err("storage unavailable".into())
        }

        async fn remove(&self, _: &str) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn update(&self, _: &str, _: &Message) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_failure_rejects_the_message() {
        let queue = Queue::new("outbox").with_hook(Persistence::new(Unavailable));

        let err = queue
            .add(Message::with_id("m", "dest", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), QueueErrorKind::Hook(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn first_sweep_after_a_restart_covers_every_stored_message() {
        let collection = InMemoryCollection::default();
        for i in 0..3u64 {
            collection
                .add(&Message::with_id(format!("m-{i}"), "dest", i).tagged(LAST, 10 + i))
                .await
                .unwrap();
        }
        let broker = InMemory::default();
        let mq = persisting(
            MessageQueue::new(Transport::new(broker.clone())),
            collection.clone(),
        );
        mq.connect().await.unwrap();

        let outcomes = mq.process_entire_outbox().await.unwrap();

        assert_eq!(outcomes, vec![Outcome::Delivered; 3]);
        let ids: Vec<_> = broker
            .sent_messages()
            .await
            .into_iter()
            .map(|m| m.id().to_owned())
            .collect();
        assert_eq!(ids, ["m-0", "m-1", "m-2"]);
        assert!(collection.records().await.is_empty());
    }

    #[tokio::test]
    async fn pending_messages_survive_a_restart() {
        let collection = InMemoryCollection::default();
        let broker = InMemory::default();
        let clock = ManualClock::new(0);
        let start = || {
            let mq = MessageQueue::new(Transport::new(broker.clone()))
                .with_clock(Arc::new(clock.clone()));
            let mq = persisting(mq, collection.clone());
            acknowledging(mq, AckConfig::default().with_timeout(Duration::from_secs(1)))
        };

        let first = start();
        first.connect().await.unwrap();
        let id = first.send("dest", "survivor").await.unwrap();
        assert_eq!(first.process_outbox().await.unwrap(), Outcome::Pending);
        drop(first);

        let second = start();
        second.connect().await.unwrap();
        clock.advance(1_000);
        assert_eq!(second.process_outbox().await.unwrap(), Outcome::Pending);

        let sent = broker.sent_messages().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.id() == id));
        assert_eq!(sent[1].tag_str(ACK), Some("/ack"));
        assert_eq!(sent[1].tag_u64(SENT), Some(0));
    }
}
