use crate::client::{ChatBackend, EventStream};
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, CompletionRequest, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

pub const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    version: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: Option<String>, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.to_string(),
            base_url: ANTHROPIC_DEFAULT_BASE_URL.to_string(),
            version: ANTHROPIC_VERSION.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("api_key_configured", &self.api_key.is_some())
            .finish()
    }
}

#[async_trait]
impl ChatBackend for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn credential_configured(&self) -> bool {
        self.api_key.is_some()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<EventStream> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::InvalidInput(
                "anthropic api key is not configured".to_string(),
            ));
        };
        let req = AnthropicRequest::new(&self.model, request);
        tracing::debug!(
            message_count = req.messages.len(),
            max_tokens = req.max_tokens,
            temperature = req.temperature,
            "opening anthropic message stream"
        );

        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.version)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "anthropic stream rejected");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = decode_sse(response.bytes_stream())
            .map(|item| item.and_then(|(event_name, data)| decode_event(&event_name, &data)));
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: &'a [ChatMessage],
    stream: bool,
}

impl<'a> AnthropicRequest<'a> {
    fn new(model: &'a str, request: &'a CompletionRequest) -> Self {
        Self {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: &request.messages,
            stream: true,
        }
    }
}

fn decode_event(event_name: &str, data: &str) -> Result<StreamEvent> {
    match event_name {
        "message_start" => {
            let input_tokens = match serde_json::from_str::<AnthropicMessageStart>(data) {
                Ok(v) => v.message.usage.and_then(|u| u.input_tokens),
                Err(e) => {
                    tracing::debug!(error = %e, "anthropic message_start without usage");
                    None
                }
            };
            Ok(StreamEvent::MessageStart { input_tokens })
        }
        "content_block_delta" => {
            let v: AnthropicContentBlockDelta = serde_json::from_str(data).map_err(|e| {
                LlmError::StreamParse(format!("anthropic delta json error={e} data={data}"))
            })?;
            match v.delta {
                AnthropicDelta::TextDelta { text } => Ok(StreamEvent::TextDelta { text }),
                AnthropicDelta::Other => Ok(StreamEvent::Other {
                    kind: event_name.to_string(),
                }),
            }
        }
        "message_delta" => {
            let output_tokens = match serde_json::from_str::<AnthropicMessageDelta>(data) {
                Ok(v) => v.usage.and_then(|u| u.output_tokens),
                Err(e) => {
                    tracing::debug!(error = %e, "anthropic message_delta without usage");
                    None
                }
            };
            Ok(StreamEvent::MessageDelta { output_tokens })
        }
        "error" => {
            let v: AnthropicStreamError = serde_json::from_str(data).map_err(|e| {
                LlmError::StreamParse(format!("anthropic error json error={e} data={data}"))
            })?;
            Err(LlmError::Api {
                error_type: v.error.error_type,
                message: v.error.message,
            })
        }
        other => Ok(StreamEvent::Other {
            kind: other.to_string(),
        }),
    }
}

type SseItem = (String, String);

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseItem>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut exhausted)| async move {
            loop {
                if let Some((end, sep_len)) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..end + sep_len).take(end).collect();
                    if let Some(item) = parse_sse_block(&raw) {
                        return Some((Ok(item), (stream, buffer, exhausted)));
                    }
                    continue;
                }

                if exhausted {
                    // Trailing block without a terminating blank line.
                    let raw = std::mem::take(&mut buffer);
                    let item = parse_sse_block(&raw)?;
                    return Some((Ok(item), (stream, buffer, exhausted)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(LlmError::Http(e.to_string())),
                            (stream, buffer, exhausted),
                        ));
                    }
                    None => exhausted = true,
                }
            }
        },
    )
}

/// Position and length of the first blank-line separator, accepting both
/// `\n\n` and `\r\n\r\n`.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_sse_block(raw: &[u8]) -> Option<SseItem> {
    let raw = String::from_utf8_lossy(raw);
    let mut event = String::new();
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    let data = data_lines.join("\n");
    if event.is_empty() && data.is_empty() {
        return None;
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some((event, data))
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    message: AnthropicMessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStartMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamError {
    error: AnthropicStreamErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}
