#![doc = include_str!("../README.md")]

pub mod clock;
pub mod message;
pub mod processor;
pub mod qos;
pub mod queue;
pub mod signing;
pub mod store;
pub mod transport;
pub mod worker;

#[doc(inline)]
pub use message::{Message, Tags};

#[doc(inline)]
pub use processor::{MessageQueue, Outcome};

#[doc(inline)]
pub use queue::{Queue, QueueConfig, QueueError, QueueErrorKind};

#[doc(inline)]
pub use qos::{AckConfig, acknowledging};

#[doc(inline)]
pub use signing::{Ed25519Signer, Signer, SigningError, signing};

#[doc(inline)]
pub use store::{Collection, persisting};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind, layers::json_formatting};

#[doc(inline)]
pub use worker::{Sweep, Worker, WorkerBuilder};
