//! Transport abstractions and the in-memory backend.
//!
//! The outbound half of a transport is built around Tower's `Service`
//! abstraction, so wire concerns (payload formatting, signing, timeouts, ...)
//! compose as layers while backends stay protocol-agnostic. The inbound half
//! is a [`Connector`]: the backend pushes every message received on a
//! subscribed destination into a [`Delivery`] handle.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper the processing loop sends through
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by backends to transmit messages
//! - [`Connector`]: Trait implemented by backends for connection and
//!   subscription management
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::Message;

pub use inmemory::{InMemory, InMemoryError};

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the entry point the processing loop talks to. It wraps an
/// outbound Tower `Service` together with the backend's [`Connector`] and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Exposes `connect`, `disconnect`, `on_message` and `send`
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
    connector: Arc<dyn Connector>,
}

impl<D> Transport<SenderService<D>>
where
    D: Connector + Clone + 'static,
{
    /// Create a new transport from a concrete backend.
    ///
    /// The backend is wrapped in a [`SenderService`] for the outbound path
    /// and kept as the transport's connector.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver.clone()),
            connector: Arc::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the outbound path.
    ///
    /// Layers applied later wrap earlier ones and therefore see each message
    /// first.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
            connector: self.connector,
        }
    }

    /// Open the connection to the backend.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.connector
            .connect()
            .await
            .map_err(TransportError::connection)
    }

    /// Close the connection to the backend.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.connector
            .disconnect()
            .await
            .map_err(TransportError::connection)
    }

    /// Route messages received on `to` into `delivery`.
    ///
    /// May be called before [`connect`](Transport::connect); backends keep the
    /// subscription and activate it once connected.
    pub async fn on_message(&self, to: &str, delivery: Delivery) -> Result<(), TransportError> {
        self.connector
            .on_message(to, delivery)
            .await
            .map_err(TransportError::connection)
    }

    /// Send a [`Message`] through the outbound service stack.
    pub async fn send(&self, message: Message) -> Result<(), TransportError>
    where
        S: Service<Message> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        self.service
            .clone()
            .oneshot(message)
            .await
            .map_err(|e| TransportError::sender(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors raised while connecting, disconnecting or subscribing.
    Connection(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a connection-related transport error.
    pub fn connection(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Connection(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Connection(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Message> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Message) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by backends to transmit messages.
///
/// Sends issued before the backend is connected must fail rather than be
/// dropped silently.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Transmit a message to its destination.
    async fn send(&mut self, message: Message) -> Result<(), Self::Error>;
}

/// Trait implemented by backends for connection and subscription management.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(), tower::BoxError>;

    async fn disconnect(&self) -> Result<(), tower::BoxError>;

    /// Deliver messages received on `to` into `delivery`.
    ///
    /// Registering the same delivery twice for one destination must not
    /// duplicate deliveries.
    async fn on_message(&self, to: &str, delivery: Delivery) -> Result<(), tower::BoxError>;
}

/// Inbound handle a transport pushes received messages into.
#[derive(Debug, Clone)]
pub struct Delivery(mpsc::UnboundedSender<Message>);

impl Delivery {
    /// Create a delivery handle and the receiving end it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Hand a received message over. Returns `false` once the receiving side
    /// is gone.
    pub fn deliver(&self, message: Message) -> bool {
        self.0.send(message).is_ok()
    }

    /// Whether both handles feed the same receiver.
    pub fn same_channel(&self, other: &Delivery) -> bool {
        self.0.same_channel(&other.0)
    }
}
