//! Tower layers for the outbound path, and the inbound hooks undoing them.

mod json;
mod signing;

pub use json::{JsonDecoding, JsonLayer, JsonService, json_formatting};
pub use signing::{SigningLayer, SigningService};
