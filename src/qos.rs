//! At-least-once delivery through acknowledgements.
//!
//! [`acknowledging`] attaches an [`Acknowledgement`] to a message queue. Per
//! outbound message it drives the states
//! `Unsent -> AwaitingAck -> (Acked | Resend)`:
//!
//! - Before the first transmission the message is tagged with the ack channel
//!   (`tags["ack"]`).
//! - After every transmission `tags["sent"]` is stamped and the message is
//!   deferred, so it stays in the outbox.
//! - When it comes up again it is only retransmitted once the timeout since
//!   `sent` elapsed; otherwise it is deferred again.
//! - An acknowledgement arriving on the ack channel removes it.
//!
//! On the receiving side, every successfully handled message carrying an
//! `ack` tag is answered with an ack message: addressed to that channel,
//! carrying the original id in `tags["ack"]` and an empty payload. Ack
//! messages are tagged `qos = "none"` so that they are sent once and never
//! acknowledged themselves.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    Message,
    clock::Clock,
    message::{ACK, QOS, SENT},
    processor::{Context, Handler, InboundHook, MessageQueue, OutboundHook, Step},
};

/// Value of the `qos` tag opting a message out of acknowledgement.
pub const FIRE_AND_FORGET: &str = "none";

/// Acknowledgement configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// Time to wait for an acknowledgement before retransmitting.
    pub timeout: Duration,
    /// Destination on which acknowledgements for this queue arrive.
    pub ack_channel: String,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            ack_channel: "/ack".to_owned(),
        }
    }
}

impl AckConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ack_channel(mut self, ack_channel: impl Into<String>) -> Self {
        self.ack_channel = ack_channel.into();
        self
    }
}

/// Install acknowledgement-based retries on a message queue.
///
/// Registers the request/record hook on the outbound pipeline, the ack-giving
/// hook on the inbound pipeline and the ack handler on the configured ack
/// channel, then returns the same queue.
pub fn acknowledging<S>(mq: MessageQueue<S>, config: AckConfig) -> MessageQueue<S> {
    let acknowledgement = Acknowledgement::new(config, mq.clock());
    let channel = acknowledgement.ack_channel().to_owned();

    mq.with_outbound_hook(acknowledgement.clone())
        .with_inbound_hook(acknowledgement.clone())
        .with_handler(channel, acknowledgement)
}

/// The acknowledgement state machine.
#[derive(Clone)]
pub struct Acknowledgement {
    config: AckConfig,
    clock: Arc<dyn Clock>,
}

impl Acknowledgement {
    pub fn new(config: AckConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn ack_channel(&self) -> &str {
        &self.config.ack_channel
    }

    /// Whether the last transmission is older than the timeout. A message
    /// without `sent` stamp counts as timed out.
    pub fn timed_out(&self, message: &Message) -> bool {
        let Some(sent) = message.tag_u64(SENT) else {
            return true;
        };
        let timeout = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
        self.clock.now().saturating_sub(sent) >= timeout
    }

    /// Pre-send step: request an acknowledgement on first transmission and
    /// hold back retries until the timeout elapsed.
    pub fn request(&self, message: &mut Message) -> Step {
        if is_fire_and_forget(message) {
            return Step::Proceed;
        }
        if !message.tags.contains_key(ACK) {
            message
                .tags
                .insert(ACK.to_owned(), self.config.ack_channel.clone().into());
            return Step::Proceed;
        }
        if self.timed_out(message) {
            tracing::debug!(id = message.id(), "Acknowledgement timed out, resending");
            Step::Proceed
        } else {
            Step::Defer
        }
    }

    /// Post-send step: stamp the transmission and keep the message queued
    /// until it is acknowledged.
    pub fn record_sent_and_reschedule(&self, message: &mut Message) -> Step {
        if is_fire_and_forget(message) {
            return Step::Proceed;
        }
        message.tags.insert(SENT.to_owned(), self.clock.now().into());
        Step::Defer
    }

    /// Answer a handled message that requested an acknowledgement.
    pub async fn give(&self, ctx: &Context<'_>, message: &Message) {
        if message.to() == self.config.ack_channel {
            return;
        }
        let Some(channel) = message.tag_str(ACK) else {
            return;
        };

        let ack = Message::new(channel, Value::Null)
            .tagged(ACK, message.id())
            .tagged(QOS, FIRE_AND_FORGET);
        if let Err(err) = ctx.send(ack).await {
            ctx.observer().on_queue_error(&err);
        }
    }

    /// Remove the acknowledged message from the outbox.
    ///
    /// An acknowledgement for an id that is not (or no longer) queued is
    /// reported through the observer and otherwise ignored.
    pub async fn settle(&self, ctx: &Context<'_>, ack: &Message) -> Result<(), tower::BoxError> {
        let Some(id) = ack.tag_str(ACK) else {
            return Err(format!("acknowledgement {} carries no id", ack.id()).into());
        };

        match ctx.outbox().remove(id).await {
            Ok(_) => {
                tracing::debug!(id, "Message acknowledged");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                ctx.observer().on_ack_mismatch(id);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn is_fire_and_forget(message: &Message) -> bool {
    message.tag_str(QOS) == Some(FIRE_AND_FORGET)
}

#[async_trait]
impl OutboundHook for Acknowledgement {
    async fn before_send(&self, message: &mut Message) -> Step {
        self.request(message)
    }

    async fn after_send(&self, message: &mut Message) -> Step {
        self.record_sent_and_reschedule(message)
    }
}

#[async_trait]
impl InboundHook for Acknowledgement {
    async fn after_handle(&self, ctx: &Context<'_>, message: &Message) {
        self.give(ctx, message).await;
    }
}

#[async_trait]
impl Handler for Acknowledgement {
    async fn handle(&self, ctx: &Context<'_>, message: Message) -> Result<(), tower::BoxError> {
        self.settle(ctx, &message).await
    }
}
