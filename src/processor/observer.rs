use crate::Message;

/// Observer of processing loop events.
///
/// Observers are invoked synchronously and should avoid heavy or blocking
/// work. Typical use cases include logging, metrics, and delivery
/// confirmation layered on top of the loop.
pub trait Observer: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_sent(&self, message: &Message);
    fn on_send_error(&self, message: &Message, error: &dyn std::error::Error);
    fn on_deferred(&self, message: &Message);
    fn on_dropped(&self, message: &Message, reason: &str);
    fn on_handled(&self, message: &Message);
    fn on_handler_error(&self, message: &Message, error: &dyn std::error::Error);
    fn on_unhandled(&self, message: &Message);
    fn on_ack_mismatch(&self, id: &str);
    fn on_queue_error(&self, error: &dyn std::error::Error);
}

/// Default observer implementation.
///
/// Logs loop events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultObserver;

impl Observer for DefaultObserver {
    fn on_startup(&self) {
        tracing::info!("Message queue worker is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Message queue worker is shutting down");
    }

    fn on_sent(&self, message: &Message) {
        tracing::debug!(id = message.id(), to = message.to(), "Message sent");
    }

    fn on_send_error(&self, message: &Message, error: &dyn std::error::Error) {
        tracing::error!(id = message.id(), to = message.to(), %error, "Error sending message");
    }

    fn on_deferred(&self, message: &Message) {
        tracing::trace!(id = message.id(), "Message deferred");
    }

    fn on_dropped(&self, message: &Message, reason: &str) {
        tracing::warn!(id = message.id(), to = message.to(), reason, "Message dropped");
    }

    fn on_handled(&self, message: &Message) {
        tracing::debug!(id = message.id(), to = message.to(), "Message handled");
    }

    fn on_handler_error(&self, message: &Message, error: &dyn std::error::Error) {
        tracing::error!(id = message.id(), to = message.to(), %error, "Handler failed");
    }

    fn on_unhandled(&self, message: &Message) {
        tracing::warn!(id = message.id(), to = message.to(), "No handler for destination");
    }

    fn on_ack_mismatch(&self, id: &str) {
        tracing::warn!(id, "Acknowledgement for unknown message");
    }

    fn on_queue_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Queue operation failed");
    }
}
