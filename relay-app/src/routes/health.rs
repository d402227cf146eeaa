use crate::server::RelayState;
use axum::{Extension, Json};
use std::sync::Arc;

/// Configuration echo. Never touches the upstream.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_status(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let settings = state.relay.settings();
    let environment = if state.relay.credential_configured() {
        "API Key Configured"
    } else {
        "API Key Missing"
    };

    Json(serde_json::json!({
        "message": "Claude 4 Sonnet Chat API",
        "status": "Ready",
        "model": settings.reported_model,
        "config": {
            "maxTokens": settings.max_tokens_ceiling,
            "defaultTemperature": settings.default_temperature,
        },
        "endpoints": {
            "POST /api/chat": "Send chat messages",
        },
        "environment": environment,
    }))
}
