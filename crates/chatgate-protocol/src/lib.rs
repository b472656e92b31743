//! Wire types for the public generation API and the upstream assist
//! backend, plus the stream framings used by both sides.
//!
//! This crate has no IO; the router and the upstream client serialize
//! these types over their own transports.

pub mod assist;
pub mod error;
pub mod gemini;
pub mod sse;
pub mod stream;
