//! Chat relay: validates a chat request, forwards it upstream as a stream and
//! folds the stream into one JSON document.

use crate::config::RelaySettingsConfig;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use relay_llm::{
    ChatBackend, ChatMessage, CompletionRequest, EventStream, LlmError, Role, StreamEvent,
};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Returned in place of an empty completion.
pub const FALLBACK_CONTENT: &str = "I couldn't generate a response.";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream credential is not configured")]
    ConfigurationError,

    #[error("upstream rejected credential: {0}")]
    AuthError(LlmError),

    #[error("upstream rate limited: {0}")]
    RateLimited(LlmError),

    #[error("upstream rejected request: {0}")]
    UpstreamRejected(LlmError),

    #[error("relay failure: {0}")]
    UnknownFailure(String),
}

impl RelayError {
    pub fn from_upstream(err: LlmError) -> Self {
        match err.upstream_status() {
            Some(401) => Self::AuthError(err),
            Some(429) => Self::RateLimited(err),
            Some(400) => Self::UpstreamRejected(err),
            _ => Self::UnknownFailure(err.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::ConfigurationError => "ConfigurationError",
            Self::AuthError(_) => "AuthError",
            Self::RateLimited(_) => "RateLimited",
            Self::UpstreamRejected(_) => "UpstreamRejected",
            Self::UnknownFailure(_) => "UnknownFailure",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UpstreamRejected(_) => StatusCode::BAD_REQUEST,
            Self::AuthError(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ConfigurationError | Self::UnknownFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Caller-facing message. Upstream details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "Invalid request format",
            Self::ConfigurationError => "Claude API key not configured",
            Self::AuthError(_) => "Invalid API key",
            Self::RateLimited(_) => "Rate limit exceeded. Please try again later.",
            Self::UpstreamRejected(_) => "Invalid request to Claude API",
            Self::UnknownFailure(_) => "Failed to get response from Claude",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error_kind = self.kind(), error = %self, "chat relay failed");
        } else {
            tracing::warn!(error_kind = self.kind(), error = %self, "chat relay rejected");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.public_message() })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTally {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTally {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Serialize for UsageTally {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("UsageTally", 3)?;
        s.serialize_field("input_tokens", &self.input_tokens)?;
        s.serialize_field("output_tokens", &self.output_tokens)?;
        s.serialize_field("total_tokens", &self.total_tokens())?;
        s.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResponse {
    pub content: String,
    pub usage: UsageTally,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub max_tokens_ceiling: u32,
    pub default_temperature: f64,
    pub reported_model: String,
    pub stream_timeout: Option<Duration>,
}

impl RelaySettings {
    pub fn from_config(cfg: &RelaySettingsConfig) -> Self {
        Self {
            max_tokens_ceiling: cfg.max_tokens_ceiling,
            default_temperature: cfg.default_temperature,
            reported_model: cfg.reported_model.clone(),
            stream_timeout: cfg.stream_timeout_ms.map(Duration::from_millis),
        }
    }

    /// `maxTokens` that is absent, zero, negative or not a number falls back to
    /// the ceiling. Fractions are truncated.
    fn effective_max_tokens(&self, requested: Option<&Value>) -> u32 {
        let ceiling = self.max_tokens_ceiling;
        match requested.and_then(Value::as_f64) {
            Some(n) if n >= 1.0 => {
                if n >= f64::from(ceiling) {
                    ceiling
                } else {
                    n as u32
                }
            }
            _ => ceiling,
        }
    }

    fn effective_temperature(&self, requested: Option<&Value>) -> f64 {
        requested
            .and_then(Value::as_f64)
            .unwrap_or(self.default_temperature)
    }
}

/// Validate a raw request body and build the upstream request.
///
/// Only the shape of `messages` is checked here. Message content goes
/// through untouched and upstream decides whether it is acceptable.
pub fn parse_request(body: &[u8], settings: &RelaySettings) -> Result<CompletionRequest, RelayError> {
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("request body: {e}")))?;

    let Some(Value::Array(items)) = parsed.get("messages") else {
        return Err(RelayError::InvalidRequest(
            "messages must be an array".to_string(),
        ));
    };

    let messages = items
        .iter()
        .map(|item| ChatMessage {
            role: Role::normalize(item.get("role").and_then(Value::as_str)),
            content: item.get("content").cloned().unwrap_or(Value::Null),
        })
        .collect();

    Ok(CompletionRequest {
        messages,
        max_tokens: settings.effective_max_tokens(parsed.get("maxTokens")),
        temperature: settings.effective_temperature(parsed.get("temperature")),
    })
}

pub struct ChatRelay {
    backend: Arc<dyn ChatBackend>,
    settings: RelaySettings,
}

impl ChatRelay {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: RelaySettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn credential_configured(&self) -> bool {
        self.backend.credential_configured()
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn handle(
        &self,
        body: &[u8],
        cancel: CancellationToken,
    ) -> Result<AggregatedResponse, RelayError> {
        let request = parse_request(body, &self.settings)?;
        if !self.backend.credential_configured() {
            return Err(RelayError::ConfigurationError);
        }

        tracing::info!(
            message_count = request.messages.len(),
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            upstream_model = %self.backend.model(),
            "processing chat request"
        );

        let aggregation = self.stream_and_aggregate(&request, &cancel);
        let (content, usage) = match self.settings.stream_timeout {
            Some(limit) => tokio::time::timeout(limit, aggregation)
                .await
                .map_err(|_| {
                    RelayError::UnknownFailure(format!(
                        "upstream stream exceeded {}ms",
                        limit.as_millis()
                    ))
                })??,
            None => aggregation.await?,
        };

        tracing::info!(
            content_chars = content.chars().count(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total_tokens(),
            "response generated"
        );

        Ok(AggregatedResponse {
            content: if content.is_empty() {
                FALLBACK_CONTENT.to_string()
            } else {
                content
            },
            usage,
            model: self.settings.reported_model.clone(),
        })
    }

    async fn stream_and_aggregate(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, UsageTally), RelayError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            opened = self.backend.stream_completion(request) => {
                opened.map_err(RelayError::from_upstream)?
            }
        };
        aggregate_stream(stream, cancel).await
    }
}

fn cancelled() -> RelayError {
    RelayError::UnknownFailure("aggregation cancelled before completion".to_string())
}

/// Fold upstream events into response text and usage, in arrival order.
///
/// Any error discards what has been accumulated so far.
pub async fn aggregate_stream(
    mut stream: EventStream,
    cancel: &CancellationToken,
) -> Result<(String, UsageTally), RelayError> {
    let mut content = String::new();
    let mut usage = UsageTally::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(
                    partial_chars = content.len(),
                    "caller gone; abandoning upstream stream"
                );
                return Err(cancelled());
            }
            next = stream.next() => next,
        };
        let Some(event) = next else {
            break;
        };

        match event.map_err(RelayError::from_upstream)? {
            StreamEvent::MessageStart { input_tokens } => {
                usage.input_tokens = input_tokens.unwrap_or(0);
            }
            StreamEvent::TextDelta { text } => content.push_str(&text),
            StreamEvent::MessageDelta { output_tokens } => {
                usage.output_tokens = output_tokens.unwrap_or(0);
            }
            StreamEvent::Other { kind } => {
                tracing::trace!(%kind, "ignoring upstream event");
            }
        }
    }

    Ok((content, usage))
}
