use crate::relay::RelayError;
use crate::server::RelayState;
use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use std::sync::Arc;
use tracing::Instrument;

/// Relay one chat request and answer with the aggregated completion.
///
/// Aggregation runs on its own task under a child of the shutdown token. If
/// this handler is dropped because the caller went away, the drop guard
/// cancels that token and the task stops reading the upstream stream.
#[tracing::instrument(level = "info", skip_all)]
pub async fn post_chat(Extension(state): Extension<Arc<RelayState>>, body: Bytes) -> Response {
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let relay = state.relay.clone();

    let task = tokio::spawn(
        async move { relay.handle(&body, cancel).await }.instrument(tracing::Span::current()),
    );
    let outcome = task.await;
    let _ = guard.disarm();

    match outcome {
        Ok(Ok(resp)) => Json(resp).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => RelayError::UnknownFailure(format!("relay task failed: {e}")).into_response(),
    }
}
