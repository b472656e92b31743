//! Client for the session-oriented upstream assist backend.
//!
//! One [`UpstreamClient`] per provider credential set. It keeps a derived
//! bearer token alive, creates upstream sessions, and drives the streaming
//! assist call through the incremental array parser. Instances are pooled
//! in [`ClientCache`] keyed by `(provider_id, csesidx)`.

mod cache;
mod client;
mod error;
mod token;

pub use cache::ClientCache;
pub use client::{AssistOutcome, InlineMedia, UpstreamClient, UpstreamConfig, UpstreamCredentials};
pub use error::UpstreamError;
