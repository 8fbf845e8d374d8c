//! Interceptor slots of the processing loop.
//!
//! Outbound messages pass through every [`OutboundHook`] before and after the
//! transport call; inbound messages pass through every [`InboundHook`] around
//! the [`Handler`] registered for their destination. Hooks steer the loop by
//! returning a [`Step`].

use async_trait::async_trait;

use crate::{
    Message,
    processor::Observer,
    queue::{Queue, QueueError},
};

/// What the loop should do with the message after a hook ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Continue with the next hook, then the transport call or handler.
    Proceed,
    /// Stop this pass and push the message to the back of its queue.
    Defer,
    /// Stop this pass and discard the message.
    Abort(String),
}

/// Interceptor around the transport call.
#[async_trait]
pub trait OutboundHook: Send + Sync {
    /// Runs on the queued copy before transmission. Changes made here are
    /// kept if the message is deferred afterwards.
    async fn before_send(&self, _message: &mut Message) -> Step {
        Step::Proceed
    }

    /// Runs after a successful transmission. Unless some hook asks for
    /// [`Step::Defer`], the message is considered delivered and removed.
    async fn after_send(&self, _message: &mut Message) -> Step {
        Step::Proceed
    }
}

/// Interceptor around handler invocation.
#[async_trait]
pub trait InboundHook: Send + Sync {
    async fn before_handle(&self, _ctx: &Context<'_>, _message: &mut Message) -> Step {
        Step::Proceed
    }

    /// Runs only after the handler succeeded.
    async fn after_handle(&self, _ctx: &Context<'_>, _message: &Message) {}
}

/// Handler for messages received on one destination.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context<'_>, message: Message) -> Result<(), tower::BoxError>;
}

/// Returns a [`Handler`] calling the given closure.
///
/// ```rust
/// use courier::processor::handler_fn;
///
/// let print = handler_fn(|_ctx, message| {
///     println!("{} received {}", message.to(), message.payload);
///     Ok(())
/// });
/// # let _ = print;
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&Context<'_>, Message) -> Result<(), tower::BoxError> + Send + Sync,
{
    HandlerFn { f }
}

/// A [`Handler`] implemented by a closure, see [`handler_fn`].
#[derive(Clone, Copy)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Context<'_>, Message) -> Result<(), tower::BoxError> + Send + Sync,
{
    async fn handle(&self, ctx: &Context<'_>, message: Message) -> Result<(), tower::BoxError> {
        (self.f)(ctx, message)
    }
}

/// What handlers and inbound hooks may reach while a message is processed.
pub struct Context<'a> {
    outbox: &'a Queue,
    observer: &'a dyn Observer,
}

impl<'a> Context<'a> {
    pub(crate) fn new(outbox: &'a Queue, observer: &'a dyn Observer) -> Self {
        Self { outbox, observer }
    }

    /// Queue a message for sending.
    pub async fn send(&self, message: Message) -> Result<(), QueueError> {
        self.outbox.add(message).await
    }

    pub fn outbox(&self) -> &Queue {
        self.outbox
    }

    pub fn observer(&self) -> &dyn Observer {
        self.observer
    }
}
