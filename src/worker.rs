//! Background processing of a message queue.
//!
//! A [`Worker`] drives a [`MessageQueue`] on a fixed interval until its
//! [`CancellationToken`] is triggered. Every tick runs one [`Sweep`]; queue
//! failures are reported through the queue's observer and never stop the
//! loop.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{Message, processor::MessageQueue};

/// How much work a single tick does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sweep {
    /// One outbound and one inbound step.
    One,
    /// Every message queued at the start of the tick, outbox then inbox.
    #[default]
    All,
}

/// Builder for creating a [`Worker`].
pub struct WorkerBuilder {
    interval: Duration,
    sweep: Sweep,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl WorkerBuilder {
    /// Create a new `WorkerBuilder` ticking at the specified interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sweep: Sweep::default(),
        }
    }

    pub fn sweep(mut self, sweep: Sweep) -> Self {
        self.sweep = sweep;
        self
    }

    /// Start the worker in the background.
    ///
    /// The first tick happens immediately. The queue's transport should be
    /// connected beforehand; until it is, outbound messages stay queued.
    pub fn start<S>(self, mq: Arc<MessageQueue<S>>, cancel: CancellationToken) -> Worker
    where
        S: Service<Message> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let WorkerBuilder { interval, sweep } = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            mq.observer().on_startup();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = match sweep {
                            Sweep::One => mq.send_and_receive().await.map(|_| ()),
                            Sweep::All => mq.send_and_receive_all().await,
                        };
                        if let Err(err) = result {
                            mq.observer().on_queue_error(&err);
                        }
                    }
                }
            }

            mq.observer().on_shutdown();
        });

        Worker { handle }
    }
}

/// Handle to a running worker.
pub struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    /// Wait for the worker to stop after its token was cancelled.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.handle.await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
