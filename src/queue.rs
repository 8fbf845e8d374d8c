//! Ordered, hookable message queues.
//!
//! A [`Queue`] maps message ids to in-flight [`Message`]s and hands them out
//! oldest first, ordered by the `last` tag it stamps on every `add` and
//! `defer`. The same type backs both the outbox and the inbox of a
//! [`MessageQueue`](crate::MessageQueue).
//!
//! ## Ordering
//!
//! Members are indexed by `(last, id)`, so [`Queue::peek_next`] returns the
//! smallest `last` and breaks ties by id. Stamps handed out by one queue are
//! strictly increasing: `max(clock.now(), previous + 1)`.
//!
//! ## Hooks
//!
//! Every operation invokes the registered [`QueueHook`]s before and after the
//! state transition, in registration order, while the queue lock is held.
//! Persistence uses this to hydrate the queue lazily and to mirror every
//! mutation. A hook must not call back into the queue it is registered on.
//!
//! `after_add`, `after_remove` and `after_defer` see the resulting message
//! before the change is applied: if one of them fails the operation is
//! rejected and the members are left untouched.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::{
    Message,
    clock::{Clock, SystemClock},
    message::LAST,
};

/// Error returned by queue operations.
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    kind: QueueErrorKind,
}

/// Queue error kinds.
#[derive(Debug)]
pub enum QueueErrorKind {
    /// No member with the given id.
    NotFound(String),
    /// A member with the given id is already queued.
    DuplicateKey(String),
    /// The queue reached its configured capacity.
    Full(usize),
    /// A registered hook failed.
    Hook(tower::BoxError),
}

impl QueueError {
    fn new(kind: QueueErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        Self::new(QueueErrorKind::NotFound(id.to_owned()))
    }

    fn duplicate(id: &str) -> Self {
        Self::new(QueueErrorKind::DuplicateKey(id.to_owned()))
    }

    fn full(capacity: usize) -> Self {
        Self::new(QueueErrorKind::Full(capacity))
    }

    /// Wrap a hook failure.
    pub fn hook(err: impl Into<tower::BoxError>) -> Self {
        Self::new(QueueErrorKind::Hook(err.into()))
    }

    pub fn kind(&self) -> &QueueErrorKind {
        &self.kind
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, QueueErrorKind::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self.kind, QueueErrorKind::DuplicateKey(_))
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            QueueErrorKind::NotFound(id) => writeln!(f, "Message not found: {id}"),
            QueueErrorKind::DuplicateKey(id) => writeln!(f, "Message already queued: {id}"),
            QueueErrorKind::Full(capacity) => writeln!(f, "Queue is full ({capacity} messages)"),
            QueueErrorKind::Hook(err) => writeln!(f, "Queue hook error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            QueueErrorKind::Hook(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of members. `add` on a full queue is rejected with
    /// [`QueueErrorKind::Full`]. Unbounded when `None`.
    pub capacity: Option<usize>,
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// The members of a queue, indexed by id and by `(last, id)`.
///
/// Both indexes are only ever updated together.
#[derive(Debug, Default)]
pub struct Members {
    messages: HashMap<String, Message>,
    order: BTreeSet<(u64, String)>,
    latest: Option<u64>,
}

impl Members {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// The member with the smallest `last` stamp.
    pub fn first(&self) -> Option<&Message> {
        self.order
            .first()
            .and_then(|(_, id)| self.messages.get(id))
    }

    /// Iterate members in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|(_, id)| self.messages.get(id))
    }

    /// Insert a message as-is, keeping its current `last` stamp.
    ///
    /// Replaces and returns a member with the same id. Used by the queue
    /// itself and by hooks restoring previously stored members.
    pub fn insert(&mut self, message: Message) -> Option<Message> {
        let previous = self.remove(message.id());
        let last = message.last();
        self.latest = Some(self.latest.map_or(last, |latest| latest.max(last)));
        self.order.insert((last, message.id().to_owned()));
        self.messages.insert(message.id().to_owned(), message);
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let message = self.messages.remove(id)?;
        self.order.remove(&(message.last(), id.to_owned()));
        Some(message)
    }

    /// The stamp the next add or defer receives. Taken once the member is
    /// inserted.
    fn next_stamp(&self, now: u64) -> u64 {
        match self.latest {
            Some(latest) => now.max(latest + 1),
            None => now,
        }
    }
}

/// Interceptor invoked around queue state transitions.
///
/// All methods default to no-ops. `before_*` hooks get mutable access to the
/// members so that they can restore state lazily. `after_*` hooks observe
/// the message being added, removed, deferred or read; a failing mutation
/// hook leaves the queue as it was.
#[async_trait]
pub trait QueueHook: Send + Sync {
    async fn before_add(
        &self,
        _members: &mut Members,
        _message: &mut Message,
    ) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Runs once the message is stamped, right before it becomes visible.
    /// A failure rejects the message.
    async fn after_add(&self, _message: &mut Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    async fn before_remove(&self, _members: &mut Members, _id: &str) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Runs before the member leaves the queue. A failure keeps it queued.
    async fn after_remove(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    async fn before_defer(
        &self,
        _members: &mut Members,
        _message: &mut Message,
    ) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Runs with the restamped message before it replaces the stored one.
    /// A failure keeps the previous copy and stamp.
    async fn after_defer(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Runs before `peek_next`, `get` and `snapshot`.
    async fn before_get(&self, _members: &mut Members) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Runs on the member returned by `peek_next` or `get`.
    async fn after_get(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

/// An ordered message queue guarded by a single lock.
pub struct Queue {
    name: String,
    members: Mutex<Members>,
    hooks: Vec<Arc<dyn QueueHook>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl Queue {
    /// Create an empty, unbounded queue using the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(Members::default()),
            hooks: Vec::new(),
            clock: Arc::new(SystemClock),
            config: QueueConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hook(mut self, hook: impl QueueHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn set_config(&mut self, config: QueueConfig) {
        self.config = config;
    }

    pub(crate) fn register(&mut self, hook: Arc<dyn QueueHook>) {
        self.hooks.push(hook);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stamp `last` and insert the message.
    ///
    /// Ids are unique within a queue: adding an id that is already present is
    /// rejected with [`QueueErrorKind::DuplicateKey`] and leaves the queue
    /// untouched.
    #[instrument(skip_all, fields(queue = %self.name, id = %message.id()))]
    pub async fn add(&self, mut message: Message) -> Result<(), QueueError> {
        let mut members = self.members.lock().await;

        for hook in &self.hooks {
            hook.before_add(&mut members, &mut message)
                .await
                .map_err(QueueError::hook)?;
        }

        if members.contains(message.id()) {
            return Err(QueueError::duplicate(message.id()));
        }
        if let Some(capacity) = self.config.capacity {
            if members.len() >= capacity {
                return Err(QueueError::full(capacity));
            }
        }

        let stamp = members.next_stamp(self.clock.now());
        message.tags.insert(LAST.to_owned(), stamp.into());

        for hook in &self.hooks {
            hook.after_add(&mut message)
                .await
                .map_err(QueueError::hook)?;
        }

        members.insert(message);
        tracing::trace!(last = stamp, "Message added");
        Ok(())
    }

    /// Remove a member by id and return it.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn remove(&self, id: &str) -> Result<Message, QueueError> {
        let mut members = self.members.lock().await;

        for hook in &self.hooks {
            hook.before_remove(&mut members, id)
                .await
                .map_err(QueueError::hook)?;
        }

        let Some(message) = members.get(id) else {
            return Err(QueueError::not_found(id));
        };

        for hook in &self.hooks {
            hook.after_remove(message)
                .await
                .map_err(QueueError::hook)?;
        }

        let message = members.remove(id).ok_or_else(|| QueueError::not_found(id))?;
        tracing::trace!("Message removed");
        Ok(message)
    }

    /// Push a member to the back of the delivery order.
    ///
    /// The given message replaces the stored one (so tag changes made while it
    /// was out of the queue are kept) and gets a fresh `last` stamp, which is
    /// returned. Fails with [`QueueErrorKind::NotFound`] if the member was
    /// removed in the meantime.
    #[instrument(skip_all, fields(queue = %self.name, id = %message.id()))]
    pub async fn defer(&self, mut message: Message) -> Result<u64, QueueError> {
        let mut members = self.members.lock().await;

        for hook in &self.hooks {
            hook.before_defer(&mut members, &mut message)
                .await
                .map_err(QueueError::hook)?;
        }

        let Some(stored) = members.get(message.id()) else {
            return Err(QueueError::not_found(message.id()));
        };
        if message.private.is_empty() {
            message.private = stored.private.clone();
        }

        let stamp = members.next_stamp(self.clock.now());
        message.tags.insert(LAST.to_owned(), stamp.into());

        for hook in &self.hooks {
            hook.after_defer(&message)
                .await
                .map_err(QueueError::hook)?;
        }

        members.insert(message);
        tracing::trace!(last = stamp, "Message deferred");
        Ok(stamp)
    }

    /// A copy of the member with the smallest `last` stamp, `None` when empty.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn peek_next(&self) -> Result<Option<Message>, QueueError> {
        let mut members = self.members.lock().await;
        self.before_get(&mut members).await?;
        let Some(message) = members.first() else {
            return Ok(None);
        };
        self.after_get(message).await?;
        Ok(Some(message.clone()))
    }

    /// A copy of the member with the given id.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn get(&self, id: &str) -> Result<Message, QueueError> {
        let mut members = self.members.lock().await;
        self.before_get(&mut members).await?;
        let message = members.get(id).ok_or_else(|| QueueError::not_found(id))?;
        self.after_get(message).await?;
        Ok(message.clone())
    }

    /// Copies of all members in delivery order.
    pub async fn snapshot(&self) -> Result<Vec<Message>, QueueError> {
        let mut members = self.members.lock().await;
        self.before_get(&mut members).await?;
        Ok(members.iter().cloned().collect())
    }

    /// Number of members currently held in memory.
    ///
    /// Does not run hooks, so members a hook restores lazily are not counted
    /// until the first `peek_next`, `get` or `snapshot`.
    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.members.lock().await.contains(id)
    }

    async fn before_get(&self, members: &mut Members) -> Result<(), QueueError> {
        for hook in &self.hooks {
            hook.before_get(members).await.map_err(QueueError::hook)?;
        }
        Ok(())
    }

    async fn after_get(&self, message: &Message) -> Result<(), QueueError> {
        for hook in &self.hooks {
            hook.after_get(message).await.map_err(QueueError::hook)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("hooks", &self.hooks.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    fn queue(clock: &ManualClock) -> Queue {
        Queue::new("test").with_clock(Arc::new(clock.clone()))
    }

    fn msg(id: &str) -> Message {
        Message::with_id(id, "dest", Value::Null)
    }

    #[tokio::test]
    async fn length_tracks_adds_and_removes() {
        let clock = ManualClock::new(0);
        let queue = queue(&clock);

        for i in 0..10 {
            queue.add(msg(&format!("m-{i}"))).await.unwrap();
        }
        for i in (0..10).step_by(3) {
            queue.remove(&format!("m-{i}")).await.unwrap();
        }

        assert_eq!(queue.len().await, 10 - 4);
        for i in 0..10 {
            let present = queue.get(&format!("m-{i}")).await.is_ok();
            assert_eq!(present, i % 3 != 0);
        }
    }

    #[tokio::test]
    async fn peek_returns_oldest_and_defer_moves_to_back() {
        let clock = ManualClock::new(100);
        let queue = queue(&clock);

        queue.add(msg("a")).await.unwrap();
        clock.advance(10);
        queue.add(msg("b")).await.unwrap();
        clock.advance(10);
        queue.add(msg("c")).await.unwrap();

        let first = queue.peek_next().await.unwrap().unwrap();
        assert_eq!(first.id(), "a");

        let before = first.last();
        let stamp = queue.defer(first).await.unwrap();
        assert!(stamp > before);
        assert_eq!(queue.get("a").await.unwrap().last(), stamp);

        assert_eq!(queue.peek_next().await.unwrap().unwrap().id(), "b");
    }

    #[tokio::test]
    async fn stamps_strictly_increase_with_a_frozen_clock() {
        let clock = ManualClock::new(5);
        let queue = queue(&clock);

        queue.add(msg("a")).await.unwrap();
        queue.add(msg("b")).await.unwrap();
        let a = queue.get("a").await.unwrap();
        let b = queue.get("b").await.unwrap();
        assert_eq!(a.last(), 5);
        assert_eq!(b.last(), 6);

        let stamp = queue.defer(a).await.unwrap();
        assert_eq!(stamp, 7);
        assert_eq!(queue.peek_next().await.unwrap().unwrap().id(), "b");
    }

    #[tokio::test]
    async fn ties_break_by_id() {
        let mut members = Members::default();
        members.insert(msg("zulu").tagged(LAST, 3));
        members.insert(msg("alpha").tagged(LAST, 3));
        members.insert(msg("mike").tagged(LAST, 4));

        let order: Vec<_> = members.iter().map(|m| m.id().to_owned()).collect();
        assert_eq!(order, ["alpha", "zulu", "mike"]);
        assert_eq!(members.first().unwrap().id(), "alpha");
    }

    #[tokio::test]
    async fn empty_queue_peeks_none() {
        let queue = Queue::new("empty");
        assert!(queue.peek_next().await.unwrap().is_none());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let queue = Queue::new("dups");
        queue.add(msg("a").tagged("marker", 1)).await.unwrap();

        let err = queue.add(msg("a")).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get("a").await.unwrap().tags["marker"], 1);
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let queue = Queue::new("missing");

        assert!(queue.remove("nope").await.unwrap_err().is_not_found());
        assert!(queue.get("nope").await.unwrap_err().is_not_found());
        assert!(queue.defer(msg("nope")).await.unwrap_err().is_not_found());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn full_queue_sheds_newcomers() {
        let queue = Queue::new("bounded").with_config(QueueConfig::default().with_capacity(2));
        queue.add(msg("a")).await.unwrap();
        queue.add(msg("b")).await.unwrap();

        let err = queue.add(msg("c")).await.unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::Full(2)));

        queue.remove("a").await.unwrap();
        queue.add(msg("c")).await.unwrap();
    }

    #[tokio::test]
    async fn defer_keeps_new_tags_and_private_data() {
        let queue = Queue::new("tags");
        let mut message = msg("a");
        message.private.insert("storage_id".into(), "1".into());
        queue.add(message).await.unwrap();

        let mut out = queue.peek_next().await.unwrap().unwrap();
        out.tags.insert("sent".into(), 42.into());
        out.private.clear();
        queue.defer(out).await.unwrap();

        let stored = queue.get("a").await.unwrap();
        assert_eq!(stored.tag_u64("sent"), Some(42));
        assert_eq!(stored.private["storage_id"], "1");
    }

    #[tokio::test]
    async fn remove_and_defer_race_cleanly() {
        let queue = Arc::new(Queue::new("race"));
        for i in 0..50 {
            queue.add(msg(&format!("m-{i}"))).await.unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..50 {
            let id = format!("m-{i}");
            let deferring = queue.clone();
            let removing = queue.clone();
            let message = queue.get(&id).await.unwrap();
            tasks.push(tokio::spawn(async move {
                match deferring.defer(message).await {
                    Ok(_) => {}
                    Err(err) => assert!(err.is_not_found()),
                }
            }));
            tasks.push(tokio::spawn(async move {
                removing.remove(&id).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(queue.is_empty().await);
    }

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, point: &str) {
            self.log.lock().unwrap().push(format!("{}:{point}", self.name));
        }
    }

    #[async_trait]
    impl QueueHook for Recorder {
        async fn before_add(&self, _: &mut Members, _: &mut Message) -> Result<(), tower::BoxError> {
            self.push("before_add");
            Ok(())
        }
        async fn after_add(&self, _: &mut Message) -> Result<(), tower::BoxError> {
            self.push("after_add");
            Ok(())
        }
        async fn before_remove(&self, _: &mut Members, _: &str) -> Result<(), tower::BoxError> {
            self.push("before_remove");
            Ok(())
        }
        async fn after_remove(&self, _: &Message) -> Result<(), tower::BoxError> {
            self.push("after_remove");
            Ok(())
        }
        async fn after_defer(&self, _: &Message) -> Result<(), tower::BoxError> {
            self.push("after_defer");
            Ok(())
        }
        async fn before_get(&self, _: &mut Members) -> Result<(), tower::BoxError> {
            self.push("before_get");
            Ok(())
        }
        async fn after_get(&self, _: &Message) -> Result<(), tower::BoxError> {
            self.push("after_get");
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let queue = Queue::new("hooked")
            .with_hook(Recorder { name: "one", log: log.clone() })
            .with_hook(Recorder { name: "two", log: log.clone() });

        queue.add(msg("a")).await.unwrap();
        let next = queue.peek_next().await.unwrap().unwrap();
        queue.defer(next).await.unwrap();
        queue.remove("a").await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            [
                "one:before_add",
                "two:before_add",
                "one:after_add",
                "two:after_add",
                "one:before_get",
                "two:before_get",
                "one:after_get",
                "two:after_get",
                "one:after_defer",
                "two:after_defer",
                "one:before_remove",
                "two:before_remove",
                "one:after_remove",
                "two:after_remove",
            ]
        );
    }

    struct Rejecting;

    #[async_trait]
    impl QueueHook for Rejecting {
        async fn after_add(&self, _: &mut Message) -> Result<(), tower::BoxError> {
            Err("store unavailable".into())
        }
    }

    #[tokio::test]
    async fn failing_after_add_rejects_the_message() {
        let queue = Queue::new("rejecting").with_hook(Rejecting);

        let err = queue.add(msg("a")).await.unwrap_err();
        assert!(matches!(err.kind(), QueueErrorKind::Hook(_)));
        assert!(queue.is_empty().await);
    }

    struct Frozen;

    #[async_trait]
    impl QueueHook for Frozen {
        async fn after_remove(&self, _: &Message) -> Result<(), tower::BoxError> {
            Err("store unavailable".into())
        }
        async fn after_defer(&self, _: &Message) -> Result<(), tower::BoxError> {
            Err("store unavailable".into())
        }
    }

    #[tokio::test]
    async fn failing_after_remove_keeps_the_member() {
        let queue = Queue::new("frozen").with_hook(Frozen);
        queue.add(msg("a")).await.unwrap();

        let err = queue.remove("a").await.unwrap_err();

        assert!(matches!(err.kind(), QueueErrorKind::Hook(_)));
        assert!(queue.contains("a").await);
        assert_eq!(queue.peek_next().await.unwrap().unwrap().id(), "a");
    }

    #[tokio::test]
    async fn failing_after_defer_keeps_the_previous_copy() {
        let clock = ManualClock::new(7);
        let queue = Queue::new("frozen")
            .with_clock(Arc::new(clock.clone()))
            .with_hook(Frozen);
        queue.add(msg("a")).await.unwrap();
        queue.add(msg("b")).await.unwrap();

        let out = queue.peek_next().await.unwrap().unwrap().tagged("sent", 1);
        let err = queue.defer(out).await.unwrap_err();

        assert!(matches!(err.kind(), QueueErrorKind::Hook(_)));
        let stored = queue.get("a").await.unwrap();
        assert_eq!(stored.last(), 7);
        assert_eq!(stored.tag_u64("sent"), None);
        assert_eq!(queue.peek_next().await.unwrap().unwrap().id(), "a");
    }
}
