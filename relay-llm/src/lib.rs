//! Upstream LLM client for the chat relay.
//!
//! Speaks the Anthropic Messages streaming protocol and decodes it into
//! [`StreamEvent`]s. The relay depends only on [`ChatBackend`], so tests can
//! swap in a scripted event stream.

mod anthropic;
mod client;
mod error;
mod types;

pub use anthropic::{ANTHROPIC_DEFAULT_BASE_URL, ANTHROPIC_VERSION, AnthropicClient};
pub use client::{ChatBackend, EventStream, build_http_client};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, CompletionRequest, Role, StreamEvent};
