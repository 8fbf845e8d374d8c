use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    Message,
    store::{Collection, Record},
};

/// A storage operation, as recorded in the changelog.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Load,
    Add(String, Message),
    Remove(String),
    Update(String, Message),
}

/// An in-memory collection for testing or local usage.
///
/// Assigns sequential storage ids (`"1"`, `"2"`, ...) and records every
/// operation in a changelog. Clones share the same storage, so a collection
/// outlives the queues it is attached to.
#[derive(Clone, Default)]
pub struct InMemoryCollection {
    inner: Arc<Mutex<Storage>>,
}

#[derive(Default)]
struct Storage {
    records: BTreeMap<u64, Message>,
    next: u64,
    changelog: Vec<Operation>,
}

impl InMemoryCollection {
    /// Every operation performed so far, oldest first.
    pub async fn changelog(&self) -> Vec<Operation> {
        self.inner.lock().await.changelog.clone()
    }

    /// The stored records, by storage id.
    pub async fn records(&self) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .map(|(id, message)| Record {
                storage_id: id.to_string(),
                message: message.clone(),
            })
            .collect()
    }
}

/// Stored copies carry no local bookkeeping, like serialized ones.
fn detached(message: &Message) -> Message {
    let mut copy = message.clone();
    copy.private.clear();
    copy
}

fn parse(storage_id: &str) -> Result<u64, InMemoryCollectionError> {
    storage_id
        .parse()
        .map_err(|_| InMemoryCollectionError::not_found(storage_id))
}

#[async_trait]
impl Collection for InMemoryCollection {
    type Error = InMemoryCollectionError;

    async fn load(&self) -> Result<Vec<Record>, Self::Error> {
        let mut storage = self.inner.lock().await;
        storage.changelog.push(Operation::Load);
        Ok(storage
            .records
            .iter()
            .map(|(id, message)| Record {
                storage_id: id.to_string(),
                message: message.clone(),
            })
            .collect())
    }

    async fn add(&self, message: &Message) -> Result<String, Self::Error> {
        let mut storage = self.inner.lock().await;
        storage.next += 1;
        let id = storage.next;
        let message = detached(message);
        storage
            .changelog
            .push(Operation::Add(id.to_string(), message.clone()));
        storage.records.insert(id, message);
        Ok(id.to_string())
    }

    async fn remove(&self, storage_id: &str) -> Result<(), Self::Error> {
        let mut storage = self.inner.lock().await;
        storage
            .records
            .remove(&parse(storage_id)?)
            .ok_or_else(|| InMemoryCollectionError::not_found(storage_id))?;
        storage
            .changelog
            .push(Operation::Remove(storage_id.to_owned()));
        Ok(())
    }

    async fn update(&self, storage_id: &str, message: &Message) -> Result<(), Self::Error> {
        let mut storage = self.inner.lock().await;
        let message = detached(message);
        let stored = storage
            .records
            .get_mut(&parse(storage_id)?)
            .ok_or_else(|| InMemoryCollectionError::not_found(storage_id))?;
        *stored = message.clone();
        storage
            .changelog
            .push(Operation::Update(storage_id.to_owned(), message));
        Ok(())
    }
}

/// Error type for `InMemoryCollection` operations.
#[derive(Debug)]
pub struct InMemoryCollectionError {
    kind: InMemoryCollectionErrorKind,
}

impl InMemoryCollectionError {
    fn not_found(storage_id: &str) -> Self {
        Self {
            kind: InMemoryCollectionErrorKind::NotFound(storage_id.to_owned()),
        }
    }
}

impl std::fmt::Display for InMemoryCollectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryCollectionErrorKind::NotFound(id) => {
                write!(f, "Record {id} not found in in-memory collection")
            }
        }
    }
}

impl std::error::Error for InMemoryCollectionError {}

#[derive(Debug)]
enum InMemoryCollectionErrorKind {
    NotFound(String),
}
