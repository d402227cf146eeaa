use crate::error::Result;
use crate::types::{CompletionRequest, StreamEvent};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Upstream completion service the relay forwards to.
///
/// Built once at startup and shared across requests; implementations must not
/// keep per-request state.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model identifier sent on every upstream call.
    fn model(&self) -> &str;

    /// Whether a credential is available. Checked before every call.
    fn credential_configured(&self) -> bool;

    /// Open a streaming completion. The returned stream is finite and cannot
    /// be restarted.
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<EventStream>;
}

#[tracing::instrument(level = "debug")]
pub fn build_http_client(connect_timeout: Duration) -> reqwest::Client {
    // No overall request timeout: it would also cap the streamed body.
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}
