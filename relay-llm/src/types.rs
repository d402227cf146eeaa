use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Anything other than exactly `"user"` is treated as the assistant.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some("user") => Self::User,
            _ => Self::Assistant,
        }
    }
}

/// Content is forwarded as received: a string or Anthropic content blocks.
/// A message without content is sent without the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub content: serde_json::Value,
}

/// One streaming completion call. The model is owned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Decoded upstream stream event, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart { input_tokens: Option<u64> },
    TextDelta { text: String },
    MessageDelta { output_tokens: Option<u64> },
    /// Any event the relay does not act on (pings, block boundaries, tool deltas).
    Other { kind: String },
}
