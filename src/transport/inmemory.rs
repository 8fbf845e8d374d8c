use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::{
    Message,
    transport::{Connector, Delivery, Sender},
};

/// In-memory transport for testing or local pipelines.
///
/// Clones share one broker: every message sent through any clone is recorded
/// and routed to the deliveries subscribed to its destination. It is useful
/// for:
/// - Unit and integration testing
/// - Wiring several message queues together in one process
/// - Debugging message flows
#[derive(Clone, Default)]
pub struct InMemory {
    inner: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    connected: AtomicBool,
    sent: Mutex<Vec<Message>>,
    routes: Mutex<HashMap<String, Vec<Delivery>>>,
}

impl InMemory {
    /// Return all messages that have been sent and clear the record.
    ///
    /// Primarily intended for testing purposes.
    pub async fn sent_messages(&self) -> Vec<Message> {
        let mut sent = self.inner.sent.lock().await;
        std::mem::take(&mut *sent)
    }

    /// Number of messages sent since the record was last cleared.
    pub async fn sent_count(&self) -> usize {
        self.inner.sent.lock().await.len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Inject an inbound message as if it arrived from the network.
    ///
    /// Returns the number of deliveries it was routed to.
    pub async fn deliver(&self, message: Message) -> usize {
        let routes = self.inner.routes.lock().await;
        let Some(deliveries) = routes.get(message.to()) else {
            tracing::debug!(to = message.to(), "No subscriber for destination");
            return 0;
        };
        deliveries
            .iter()
            .filter(|delivery| delivery.deliver(message.clone()))
            .count()
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = InMemoryError;

    /// Record the message and route it to the destination's subscribers.
    #[tracing::instrument(skip_all, fields(id = message.id(), to = message.to()))]
    async fn send(&mut self, message: Message) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(InMemoryError::NotConnected);
        }

        self.inner.sent.lock().await.push(message.clone());
        tracing::debug!(tags = ?message.tags, "Message sent to in-memory broker");
        self.deliver(message).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for InMemory {
    async fn connect(&self) -> Result<(), tower::BoxError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), tower::BoxError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_message(&self, to: &str, delivery: Delivery) -> Result<(), tower::BoxError> {
        let mut routes = self.inner.routes.lock().await;
        let deliveries = routes.entry(to.to_owned()).or_default();
        if !deliveries.iter().any(|known| known.same_channel(&delivery)) {
            deliveries.push(delivery);
        }
        Ok(())
    }
}

/// Error type for `InMemory` transport operations.
#[derive(Debug)]
pub enum InMemoryError {
    /// `send` was called before `connect`.
    NotConnected,
}

impl std::fmt::Display for InMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InMemoryError::NotConnected => write!(f, "In-memory transport is not connected"),
        }
    }
}

impl std::error::Error for InMemoryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_before_connect_fails_loudly() {
        let mut transport = InMemory::default();

        let err = transport
            .send(Message::new("dest", json!(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, InMemoryError::NotConnected));
        assert_eq!(transport.sent_count().await, 0);
    }

    #[tokio::test]
    async fn sent_messages_are_routed_to_subscribers_once() {
        let mut transport = InMemory::default();
        let (delivery, mut rx) = Delivery::channel();

        transport.on_message("dest", delivery.clone()).await.unwrap();
        transport.on_message("dest", delivery).await.unwrap();
        transport.connect().await.unwrap();

        transport.send(Message::with_id("m-1", "dest", json!("hi"))).await.unwrap();
        transport.send(Message::with_id("m-2", "elsewhere", json!("hi"))).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().id(), "m-1");
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.sent_messages().await.len(), 2);
        assert_eq!(transport.sent_count().await, 0);
    }

    #[tokio::test]
    async fn clones_share_the_broker() {
        let transport = InMemory::default();
        let mut other = transport.clone();
        let (delivery, mut rx) = Delivery::channel();

        transport.on_message("peer", delivery).await.unwrap();
        transport.connect().await.unwrap();
        other.send(Message::new("peer", json!(null))).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert_eq!(transport.deliver(Message::new("peer", json!(null))).await, 1);
        assert_eq!(transport.deliver(Message::new("nobody", json!(null))).await, 0);
    }
}
