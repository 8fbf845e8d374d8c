//! Message signing.
//!
//! A [`Signer`] adds a signature block to outbound messages and verifies and
//! strips it on inbound ones:
//!
//! ```json
//! { "signature": { "origin": "alice", "ts": "2024-05-01T12:00:00Z", "hash": "<base64>" } }
//! ```
//!
//! The signed bytes are the JSON encoding of `{payload, tags}` with sorted
//! keys, taken while the block carries `origin` and `ts` but no `hash`. The
//! queue-local `last` stamp is not covered, since every queue rewrites it.
//!
//! [`signing`] installs a [`SigningLayer`] on the outbound path and a
//! [`Validating`] hook on the inbound path. Combined with
//! [`json_formatting`](crate::transport::layers::json_formatting), apply
//! formatting first so that messages are signed before they are encoded and
//! decoded before they are validated.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::{
    rand::SystemRandom,
    signature::{ED25519, Ed25519KeyPair, KeyPair as _, UnparsedPublicKey},
};
use serde_json::{Map, Value, json};
use tracing_error::SpanTrace;

use crate::{
    Message,
    message::{LAST, SIGNATURE},
    processor::{Context, InboundHook, MessageQueue, Step},
    transport::layers::{SigningLayer, SigningService},
};

/// Signs and validates messages in place.
pub trait Signer: Send + Sync {
    /// Add a signature block to `tags["signature"]`.
    fn sign(&self, message: &mut Message) -> Result<(), SigningError>;

    /// Verify the signature block and remove it. The message is left
    /// untouched when verification fails.
    fn validate(&self, message: &mut Message) -> Result<(), SigningError>;
}

/// Install signing on a message queue.
pub fn signing<S>(
    mq: MessageQueue<S>,
    signer: impl Signer + 'static,
) -> MessageQueue<SigningService<S>> {
    let signer: Arc<dyn Signer> = Arc::new(signer);
    mq.layer(SigningLayer::new(signer.clone()))
        .with_inbound_hook(Validating::new(signer))
}

/// Error returned by signing operations.
#[derive(Debug)]
pub struct SigningError {
    context: SpanTrace,
    kind: SigningErrorKind,
}

/// Signing error kinds.
#[derive(Debug)]
pub enum SigningErrorKind {
    /// The message carries no signature block.
    Missing,
    /// The signature block lacks a field or has the wrong shape.
    Malformed(&'static str),
    /// No public key is known for the origin.
    UnknownOrigin(String),
    /// The signature does not match the message.
    Invalid,
    /// A key could not be generated or parsed.
    Key(String),
    Serde(serde_json::Error),
}

impl SigningError {
    fn new(kind: SigningErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &SigningErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SigningErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningErrorKind::Missing => write!(f, "Message is not signed"),
            SigningErrorKind::Malformed(field) => write!(f, "Malformed signature: {field}"),
            SigningErrorKind::UnknownOrigin(origin) => write!(f, "Unknown origin: {origin}"),
            SigningErrorKind::Invalid => write!(f, "Invalid signature"),
            SigningErrorKind::Key(err) => write!(f, "Key error: {err}"),
            SigningErrorKind::Serde(err) => write!(f, "Serde error: {err}"),
        }
    }
}

impl std::fmt::Display for SigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SigningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SigningErrorKind::Serde(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SigningError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(SigningErrorKind::Serde(err))
    }
}

/// Generate a new Ed25519 key pair, PKCS#8 encoded.
pub fn generate_pkcs8() -> Result<Vec<u8>, SigningError> {
    let rng = SystemRandom::new();
    let document = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|err| SigningError::new(SigningErrorKind::Key(err.to_string())))?;
    Ok(document.as_ref().to_vec())
}

/// Ed25519 signer.
///
/// Signs as `origin` with its own key pair and validates against the public
/// keys registered per origin, its own included.
pub struct Ed25519Signer {
    origin: String,
    key_pair: Ed25519KeyPair,
    peers: HashMap<String, Vec<u8>>,
}

impl Ed25519Signer {
    pub fn from_pkcs8(origin: impl Into<String>, pkcs8: &[u8]) -> Result<Self, SigningError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|err| SigningError::new(SigningErrorKind::Key(err.to_string())))?;
        let origin = origin.into();
        let peers = HashMap::from([(origin.clone(), key_pair.public_key().as_ref().to_vec())]);
        Ok(Self {
            origin,
            key_pair,
            peers,
        })
    }

    /// Trust messages signed by `origin` with the given public key.
    pub fn with_peer(mut self, origin: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        self.peers.insert(origin.into(), public_key.into());
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key().as_ref().to_vec()
    }
}

/// Bytes covered by a signature.
fn canonical(message: &Message) -> Result<Vec<u8>, SigningError> {
    let tags: Map<String, Value> = message
        .tags
        .iter()
        .filter(|(key, _)| key.as_str() != LAST)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(serde_json::to_vec(&json!({
        "payload": message.payload,
        "tags": tags,
    }))?)
}

impl Signer for Ed25519Signer {
    #[tracing::instrument(skip_all, fields(id = message.id(), origin = %self.origin))]
    fn sign(&self, message: &mut Message) -> Result<(), SigningError> {
        message.tags.insert(
            SIGNATURE.to_owned(),
            json!({
                "origin": self.origin,
                "ts": chrono::Utc::now().to_rfc3339(),
            }),
        );
        let signature = self.key_pair.sign(&canonical(message)?);

        if let Some(Value::Object(block)) = message.tags.get_mut(SIGNATURE) {
            block.insert("hash".to_owned(), STANDARD.encode(signature).into());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(id = message.id()))]
    fn validate(&self, message: &mut Message) -> Result<(), SigningError> {
        let Some(Value::Object(block)) = message.tags.get(SIGNATURE) else {
            return Err(SigningError::new(SigningErrorKind::Missing));
        };
        let mut block = block.clone();
        let hash = match block.remove("hash") {
            Some(Value::String(hash)) => hash,
            _ => return Err(SigningError::new(SigningErrorKind::Malformed("hash"))),
        };
        let Some(origin) = block.get("origin").and_then(Value::as_str) else {
            return Err(SigningError::new(SigningErrorKind::Malformed("origin")));
        };
        let Some(public_key) = self.peers.get(origin) else {
            return Err(SigningError::new(SigningErrorKind::UnknownOrigin(
                origin.to_owned(),
            )));
        };
        let signature = STANDARD
            .decode(hash)
            .map_err(|_| SigningError::new(SigningErrorKind::Malformed("hash")))?;

        let mut unsigned = message.clone();
        unsigned
            .tags
            .insert(SIGNATURE.to_owned(), Value::Object(block));
        UnparsedPublicKey::new(&ED25519, public_key)
            .verify(&canonical(&unsigned)?, &signature)
            .map_err(|_| SigningError::new(SigningErrorKind::Invalid))?;

        message.tags.remove(SIGNATURE);
        Ok(())
    }
}

/// Inbound hook dropping messages whose signature does not validate.
pub struct Validating {
    signer: Arc<dyn Signer>,
}

impl Validating {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl InboundHook for Validating {
    async fn before_handle(&self, _ctx: &Context<'_>, message: &mut Message) -> Step {
        match self.signer.validate(message) {
            Ok(()) => Step::Proceed,
            Err(err) => Step::Abort(err.kind().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        processor::{Outcome, handler_fn, tests::Recording},
        transport::{InMemory, Transport, layers::json_formatting},
    };
    use std::sync::Mutex as StdMutex;

    fn signer(origin: &str) -> Ed25519Signer {
        Ed25519Signer::from_pkcs8(origin, &generate_pkcs8().unwrap()).unwrap()
    }

    #[test]
    fn signed_messages_validate_and_lose_the_block() {
        let alice = signer("alice");
        let mut message = Message::new("dest", json!({ "a": [1, 2] })).tagged("ack", "/ack");

        alice.sign(&mut message).unwrap();
        let block = &message.tags[SIGNATURE];
        assert_eq!(block["origin"], "alice");
        assert!(block["ts"].is_string());
        assert!(block["hash"].is_string());

        alice.validate(&mut message).unwrap();
        assert!(!message.tags.contains_key(SIGNATURE));
        assert_eq!(message.tag_str("ack"), Some("/ack"));
    }

    #[test]
    fn tampering_is_detected() {
        let alice = signer("alice");
        let mut message = Message::new("dest", "original");
        alice.sign(&mut message).unwrap();

        message.payload = json!("forged");
        let err = alice.validate(&mut message).unwrap_err();

        assert!(matches!(err.kind(), SigningErrorKind::Invalid));
        assert!(message.tags.contains_key(SIGNATURE));
    }

    #[test]
    fn tag_changes_other_than_last_are_detected() {
        let alice = signer("alice");
        let mut message = Message::new("dest", "x").tagged("sent", 1);
        alice.sign(&mut message).unwrap();

        let mut restamped = message.clone().tagged(LAST, 99);
        assert!(alice.validate(&mut restamped).is_ok());

        let mut altered = message.tagged("sent", 2);
        assert!(matches!(
            alice.validate(&mut altered).unwrap_err().kind(),
            SigningErrorKind::Invalid
        ));
    }

    #[test]
    fn peers_are_trusted_by_origin() {
        let alice = signer("alice");
        let bob = signer("bob").with_peer("alice", alice.public_key());
        let mallory = signer("mallory");

        let mut from_alice = Message::new("bob", "hi");
        alice.sign(&mut from_alice).unwrap();
        assert!(bob.validate(&mut from_alice).is_ok());

        let mut from_mallory = Message::new("bob", "hi");
        mallory.sign(&mut from_mallory).unwrap();
        assert!(matches!(
            bob.validate(&mut from_mallory).unwrap_err().kind(),
            SigningErrorKind::UnknownOrigin(origin) if origin == "mallory"
        ));
    }

    #[test]
    fn unsigned_and_malformed_messages_are_rejected() {
        let alice = signer("alice");

        let mut unsigned = Message::new("dest", "x");
        assert!(matches!(
            alice.validate(&mut unsigned).unwrap_err().kind(),
            SigningErrorKind::Missing
        ));

        let mut malformed = Message::new("dest", "x")
            .tagged(SIGNATURE, json!({ "origin": "alice", "hash": "%%%" }));
        assert!(matches!(
            alice.validate(&mut malformed).unwrap_err().kind(),
            SigningErrorKind::Malformed("hash")
        ));
    }

    #[test]
    fn garbage_keys_are_rejected() {
        let err = Ed25519Signer::from_pkcs8("alice", b"not a key").err().unwrap();
        assert!(matches!(err.kind(), SigningErrorKind::Key(_)));
    }

    #[tokio::test]
    async fn signed_and_formatted_loopback() {
        let backend = InMemory::default();
        let recording = Recording::default();
        let mq = MessageQueue::new(Transport::new(backend.clone()))
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_observer(recording.clone());
        let mq = signing(json_formatting(mq), signer("loop"));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        mq.on_message(
            "dest",
            handler_fn(move |_, message| {
                sink.lock().unwrap().push(message);
                Ok(())
            }),
        )
        .await
        .unwrap();
        mq.connect().await.unwrap();

        let id = mq.send("dest", json!({ "n": 1 })).await.unwrap();
        assert_eq!(mq.process_outbox().await.unwrap(), Outcome::Delivered);

        let wire = backend.sent_messages().await;
        assert!(wire[0].payload.is_string());
        assert!(wire[0].tags.is_empty());

        assert_eq!(mq.process_inbox().await.unwrap(), Outcome::Handled);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].id(), id);
        assert_eq!(seen[0].payload, json!({ "n": 1 }));
        assert!(!seen[0].tags.contains_key(SIGNATURE));
    }

    #[tokio::test]
    async fn messages_failing_validation_are_dropped() {
        let backend = InMemory::default();
        let recording = Recording::default();
        let mq = MessageQueue::new(Transport::new(backend.clone()))
            .with_observer(recording.clone());
        let mq = signing(mq, signer("me"));
        mq.on_message("dest", handler_fn(|_, _| Ok(()))).await.unwrap();

        backend
            .deliver(Message::with_id("forged", "dest", "x"))
            .await;

        assert_eq!(mq.process_inbox().await.unwrap(), Outcome::Dropped);
        assert_eq!(
            recording.events(),
            ["dropped:forged:Message is not signed"]
        );
    }
}
