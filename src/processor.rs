//! Processing loop driving an outbox and an inbox over a transport.
//!
//! A [`MessageQueue`]:
//!
//! - Queues outbound messages in its outbox and transmits them oldest first
//! - Runs [`OutboundHook`]s around each transmission
//! - Collects inbound messages from the transport into its inbox
//! - Dispatches them to the [`Handler`] registered for their destination,
//!   wrapped by [`InboundHook`]s
//! - Reports every event to an injected [`Observer`]
//!
//! Delivery guarantees are not built in: they are attached by builder
//! functions such as [`acknowledging`](crate::qos::acknowledging), which
//! register hooks into the loop's slots and return the same queue.
//!
//! Failures are isolated to the message being processed. A transport error
//! moves the message behind its peers for a later retry, a handler error is
//! reported and the inbox moves on.

mod observer;
mod pipeline;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tower::Service;

use crate::{
    Message,
    clock::{Clock, SystemClock},
    queue::{Queue, QueueConfig, QueueError, QueueHook},
    transport::{Delivery, Transport, TransportError},
};

pub use observer::{DefaultObserver, Observer};
pub use pipeline::{Context, Handler, HandlerFn, InboundHook, OutboundHook, Step, handler_fn};

/// Result of one processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The queue had no members.
    Empty,
    /// Transmitted and removed from the outbox.
    Delivered,
    /// Transmitted and kept in the outbox, waiting for an acknowledgement.
    Pending,
    /// A hook rescheduled the message without processing it.
    Deferred,
    /// The transport failed; the message was moved to the back of the outbox.
    Retained,
    /// Discarded by a hook or for lack of a handler.
    Dropped,
    /// The handler accepted the inbound message.
    Handled,
    /// The handler failed; the inbound message was discarded.
    Failed,
}

/// Outbox, inbox and the hook pipelines around them.
///
/// Generic parameters:
/// - `S`: outbound service stack of the [`Transport`]
pub struct MessageQueue<S> {
    transport: Transport<S>,
    outbox: Queue,
    inbox: Queue,
    outbound: Vec<Arc<dyn OutboundHook>>,
    inbound: Vec<Arc<dyn InboundHook>>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    delivery: Delivery,
    received: Mutex<mpsc::UnboundedReceiver<Message>>,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
}

impl<S> MessageQueue<S> {
    /// Create a message queue with empty, unbounded queues, the system clock
    /// and the default observer.
    pub fn new(transport: Transport<S>) -> Self {
        let (delivery, received) = Delivery::channel();
        Self {
            transport,
            outbox: Queue::new("outbox"),
            inbox: Queue::new("inbox"),
            outbound: Vec::new(),
            inbound: Vec::new(),
            handlers: RwLock::new(HashMap::new()),
            delivery,
            received: Mutex::new(received),
            observer: Arc::new(DefaultObserver),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source of both queues and of hooks installed later.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.outbox.set_clock(clock.clone());
        self.inbox.set_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Replace the observer receiving loop events.
    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn with_outbox_config(mut self, config: QueueConfig) -> Self {
        self.outbox.set_config(config);
        self
    }

    pub fn with_inbox_config(mut self, config: QueueConfig) -> Self {
        self.inbox.set_config(config);
        self
    }

    /// Apply a Tower layer to the outbound transport path.
    pub fn layer<L>(self, layer: L) -> MessageQueue<L::Service>
    where
        L: tower::Layer<S>,
    {
        MessageQueue {
            transport: self.transport.layer(layer),
            outbox: self.outbox,
            inbox: self.inbox,
            outbound: self.outbound,
            inbound: self.inbound,
            handlers: self.handlers,
            delivery: self.delivery,
            received: self.received,
            observer: self.observer,
            clock: self.clock,
        }
    }

    /// Register an interceptor around transmissions.
    pub fn with_outbound_hook(mut self, hook: impl OutboundHook + 'static) -> Self {
        self.outbound.push(Arc::new(hook));
        self
    }

    /// Register an interceptor around handler invocations.
    pub fn with_inbound_hook(mut self, hook: impl InboundHook + 'static) -> Self {
        self.inbound.push(Arc::new(hook));
        self
    }

    /// Register an interceptor around outbox state transitions.
    pub fn with_outbox_hook(mut self, hook: impl QueueHook + 'static) -> Self {
        self.outbox.register(Arc::new(hook));
        self
    }

    /// Register an interceptor around inbox state transitions.
    pub fn with_inbox_hook(mut self, hook: impl QueueHook + 'static) -> Self {
        self.inbox.register(Arc::new(hook));
        self
    }

    /// Register a handler without subscribing the transport yet.
    ///
    /// The destination is subscribed on [`connect`](MessageQueue::connect).
    pub fn with_handler(self, to: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.insert_handler(to.into(), Arc::new(handler));
        self
    }

    pub fn outbox(&self) -> &Queue {
        &self.outbox
    }

    pub fn inbox(&self) -> &Queue {
        &self.inbox
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn observer(&self) -> &dyn Observer {
        self.observer.as_ref()
    }

    /// Connect the transport and subscribe every registered destination.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.transport.connect().await?;
        for to in self.destinations() {
            self.transport.on_message(&to, self.delivery.clone()).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await
    }

    /// Register `handler` for messages addressed to `to` and subscribe the
    /// transport to that destination. A previous handler is replaced.
    pub async fn on_message(
        &self,
        to: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<(), TransportError> {
        let to = to.into();
        self.insert_handler(to.clone(), Arc::new(handler));
        self.transport.on_message(&to, self.delivery.clone()).await
    }

    /// Queue a new message and return its id.
    ///
    /// Returning means the message is queued, not delivered.
    pub async fn send(
        &self,
        to: impl Into<String>,
        payload: impl Into<Value>,
    ) -> Result<String, QueueError> {
        self.send_message(Message::new(to, payload)).await
    }

    /// Queue a prepared message and return its id.
    pub async fn send_message(&self, message: Message) -> Result<String, QueueError> {
        let id = message.id().to_owned();
        self.outbox.add(message).await?;
        Ok(id)
    }

    /// Handle at most one inbound message.
    ///
    /// Messages received from the transport since the last call are moved
    /// into the inbox first.
    #[tracing::instrument(skip(self))]
    pub async fn process_inbox(&self) -> Result<Outcome, QueueError> {
        self.collect_received().await;

        let Some(mut message) = self.inbox.peek_next().await? else {
            return Ok(Outcome::Empty);
        };
        let ctx = Context::new(&self.outbox, self.observer.as_ref());

        for hook in &self.inbound {
            match hook.before_handle(&ctx, &mut message).await {
                Step::Proceed => {}
                Step::Defer => {
                    self.report_follow_up(self.inbox.defer(message.clone()).await);
                    self.observer.on_deferred(&message);
                    return Ok(Outcome::Deferred);
                }
                Step::Abort(reason) => {
                    self.report_follow_up(self.inbox.remove(message.id()).await);
                    self.observer.on_dropped(&message, &reason);
                    return Ok(Outcome::Dropped);
                }
            }
        }

        let Some(handler) = self.handler(message.to()) else {
            self.report_follow_up(self.inbox.remove(message.id()).await);
            self.observer.on_unhandled(&message);
            return Ok(Outcome::Dropped);
        };

        self.report_follow_up(self.inbox.remove(message.id()).await);
        match handler.handle(&ctx, message.clone()).await {
            Ok(()) => {
                self.observer.on_handled(&message);
                for hook in &self.inbound {
                    hook.after_handle(&ctx, &message).await;
                }
                Ok(Outcome::Handled)
            }
            Err(err) => {
                self.observer.on_handler_error(&message, err.as_ref());
                Ok(Outcome::Failed)
            }
        }
    }

    /// Handle inbound messages until the inbox is empty or every message
    /// present at the start has been visited once.
    pub async fn process_entire_inbox(&self) -> Result<Vec<Outcome>, QueueError> {
        self.collect_received().await;
        let budget = self.inbox.snapshot().await?.len();
        let mut outcomes = Vec::new();
        for _ in 0..budget {
            match self.process_inbox().await? {
                Outcome::Empty => break,
                outcome => outcomes.push(outcome),
            }
        }
        Ok(outcomes)
    }

    fn insert_handler(&self, to: String, handler: Arc<dyn Handler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.insert(to, handler);
    }

    fn handler(&self, to: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(to)
            .cloned()
    }

    fn destinations(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    async fn collect_received(&self) {
        let mut received = self.received.lock().await;
        while let Ok(message) = received.try_recv() {
            match self.inbox.add(message).await {
                Ok(()) => {}
                Err(err) if err.is_duplicate() => {
                    tracing::debug!("Duplicate inbound message ignored");
                }
                Err(err) => self.observer.on_queue_error(&err),
            }
        }
    }

    /// Report a failed follow-up queue operation. `NotFound` means a
    /// concurrent operation got there first and is not an error.
    fn report_follow_up<T>(&self, result: Result<T, QueueError>) {
        match result {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(%err, "Message already gone");
            }
            Err(err) => self.observer.on_queue_error(&err),
        }
    }
}

impl<S> MessageQueue<S>
where
    S: Service<Message> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Transmit at most one outbound message.
    ///
    /// The oldest eligible message goes through the outbound hooks, the
    /// transport, and the outbound hooks again. It is removed once delivered
    /// unless a hook keeps it queued.
    #[tracing::instrument(skip(self))]
    pub async fn process_outbox(&self) -> Result<Outcome, QueueError> {
        let Some(mut message) = self.outbox.peek_next().await? else {
            return Ok(Outcome::Empty);
        };
        let queued = message.clone();

        for hook in &self.outbound {
            match hook.before_send(&mut message).await {
                Step::Proceed => {}
                Step::Defer => {
                    self.report_follow_up(self.outbox.defer(message.clone()).await);
                    self.observer.on_deferred(&message);
                    return Ok(Outcome::Deferred);
                }
                Step::Abort(reason) => {
                    self.report_follow_up(self.outbox.remove(message.id()).await);
                    self.observer.on_dropped(&message, &reason);
                    return Ok(Outcome::Dropped);
                }
            }
        }

        if let Err(err) = self.transport.send(message.clone()).await {
            self.observer.on_send_error(&message, &err);
            self.report_follow_up(self.outbox.defer(queued).await);
            return Ok(Outcome::Retained);
        }
        self.observer.on_sent(&message);

        let mut keep = false;
        for hook in &self.outbound {
            match hook.after_send(&mut message).await {
                Step::Proceed => {}
                Step::Defer => keep = true,
                Step::Abort(reason) => {
                    self.observer.on_dropped(&message, &reason);
                    keep = false;
                    break;
                }
            }
        }

        if keep {
            self.report_follow_up(self.outbox.defer(message).await);
            Ok(Outcome::Pending)
        } else {
            self.report_follow_up(self.outbox.remove(message.id()).await);
            Ok(Outcome::Delivered)
        }
    }

    /// Process outbound messages until the outbox is empty or every message
    /// present at the start has been visited once.
    pub async fn process_entire_outbox(&self) -> Result<Vec<Outcome>, QueueError> {
        let budget = self.outbox.snapshot().await?.len();
        let mut outcomes = Vec::new();
        for _ in 0..budget {
            match self.process_outbox().await? {
                Outcome::Empty => break,
                outcome => outcomes.push(outcome),
            }
        }
        Ok(outcomes)
    }

    /// One outbound step followed by one inbound step.
    ///
    /// Both steps always run; the first error is returned.
    pub async fn send_and_receive(&self) -> Result<(Outcome, Outcome), QueueError> {
        let sent = self.process_outbox().await;
        let received = self.process_inbox().await;
        Ok((sent?, received?))
    }

    /// Sweep the entire outbox, then the entire inbox.
    pub async fn send_and_receive_all(&self) -> Result<(), QueueError> {
        let sent = self.process_entire_outbox().await;
        let received = self.process_entire_inbox().await;
        sent?;
        received?;
        Ok(())
    }
}
