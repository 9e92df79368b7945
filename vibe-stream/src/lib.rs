//! Wire shape for a single Vibe debug/interaction event: type + payload +
//! envelope.
//!
//! This crate defines the event payload ([`ProtocolEvent`]) and envelope
//! injection only; it has no dependency on `vibe-core`. A driver (`vibe-cli`
//! or an embedder) turns interpreter state transitions into `ProtocolEvent`s
//! and calls [`to_json`] to serialize each one onto its debug channel.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::ProtocolEvent;
