//! Streaming LLM client that feeds the relay engine.
//!
//! Pure HTTP: requests go straight to the provider's streaming endpoint and
//! text deltas come back as a `relay_core::FragmentStream`.

mod anthropic;
mod client;
mod error;
mod openai;
mod sse;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role};
