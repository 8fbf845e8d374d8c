//! Two peers on a shared in-memory broker.
//!
//! Alice sends a few greetings to Bob. Both queues format messages as JSON,
//! sign them with Ed25519, keep their outbox in an in-memory collection and
//! retry until the other side acknowledges.
//!
//! Run with `RUST_LOG=courier=debug cargo run --example loopback`.

use std::{sync::Arc, time::Duration};

use courier::{
    AckConfig, Ed25519Signer, MessageQueue, Sweep, Transport, WorkerBuilder, acknowledging,
    json_formatting, persisting,
    processor::handler_fn,
    signing::{generate_pkcs8, signing},
    store::inmemory::InMemoryCollection,
    transport::InMemory,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let broker = InMemory::default();

    let alice_key = Ed25519Signer::from_pkcs8("alice", &generate_pkcs8()?)?;
    let bob_key = Ed25519Signer::from_pkcs8("bob", &generate_pkcs8()?)?;
    let alice_key = alice_key.with_peer("bob", bob_key.public_key());
    let bob_key = bob_key.with_peer("alice", alice_key.public_key());

    let ack = AckConfig::default().with_timeout(Duration::from_millis(500));

    let alice = MessageQueue::new(Transport::new(broker.clone()));
    let alice = persisting(alice, InMemoryCollection::default());
    let alice = acknowledging(alice, ack.clone().with_ack_channel("/ack/alice"));
    let alice = Arc::new(signing(json_formatting(alice), alice_key));

    let bob = MessageQueue::new(Transport::new(broker.clone()));
    let bob = acknowledging(bob, ack.with_ack_channel("/ack/bob"));
    let bob = Arc::new(signing(json_formatting(bob), bob_key));
    bob.on_message(
        "bob/greetings",
        handler_fn(|_, message| {
            tracing::info!(id = message.id(), payload = %message.payload, "Bob received");
            Ok(())
        }),
    )
    .await?;

    alice.connect().await?;
    bob.connect().await?;

    for n in 0..3 {
        alice
            .send("bob/greetings", json!({ "hello": "bob", "n": n }))
            .await?;
    }

    let cancel = CancellationToken::new();
    let workers = [
        WorkerBuilder::new(Duration::from_millis(100)).start(alice.clone(), cancel.clone()),
        WorkerBuilder::new(Duration::from_millis(100))
            .sweep(Sweep::One)
            .start(bob.clone(), cancel.clone()),
    ];

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
    }
    cancel.cancel();
    for worker in workers {
        worker.join().await?;
    }

    tracing::info!(
        pending = alice.outbox().len().await,
        "Alice's outbox after shutdown"
    );
    Ok(())
}
