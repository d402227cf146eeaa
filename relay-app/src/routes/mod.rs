pub mod chat;
pub mod health;

use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::get;

pub const CHAT_PATH: &str = "/api/chat";

pub fn router() -> Router {
    Router::new().route(CHAT_PATH, get(health::get_status).post(chat::post_chat))
}

/// Gives error responses built outside the relay (body limit, timeout,
/// unknown route or method) the same `{error}` JSON shape. Status and other
/// headers are kept.
pub async fn structured_errors(response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json {
        return response;
    }

    let message = if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        "Failed to get response from Claude"
    } else {
        "Invalid request format"
    };
    tracing::warn!(status = status.as_u16(), "replacing unstructured error body");
    let (mut parts, _) = response.into_parts();
    parts.headers.remove(CONTENT_TYPE);
    parts.headers.remove(CONTENT_LENGTH);
    (parts, Json(serde_json::json!({ "error": message }))).into_response()
}
