//! Chat relay server.
//!
//! Builds the upstream client once, wraps it in a [`ChatRelay`] and serves
//! the routes behind the usual tower-http stack.

use crate::config::{RelayConfig, SUGGESTED_STREAM_TIMEOUT_MS, ServerConfig};
use crate::relay::{ChatRelay, RelaySettings};
use crate::routes;
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::{Extension, Router};
use relay_llm::{AnthropicClient, ChatBackend, build_http_client};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct RelayState {
    pub relay: Arc<ChatRelay>,
    /// Parent of every per-request cancellation token.
    pub shutdown: CancellationToken,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let bind_addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?path,
        bind_addr = %bind_addr,
        upstream_base_url = %cfg.upstream.base_url,
        upstream_model = %cfg.upstream.model,
        reported_model = %cfg.relay.reported_model,
        max_tokens_ceiling = cfg.relay.max_tokens_ceiling,
        default_temperature = cfg.relay.default_temperature,
        stream_timeout_ms = ?cfg.relay.stream_timeout_ms,
        api_key_configured = cfg.api_key().is_some(),
        "config ok"
    );
    if cfg.api_key().is_none() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; chat requests will fail with 500");
    }
    if cfg.relay.stream_timeout_ms.is_none() {
        tracing::info!(
            suggested_stream_timeout_ms = SUGGESTED_STREAM_TIMEOUT_MS,
            "stream timeout disabled"
        );
    }
    if cfg.upstream.model != cfg.relay.reported_model {
        tracing::info!(
            upstream_model = %cfg.upstream.model,
            reported_model = %cfg.relay.reported_model,
            "reported model differs from the model sent upstream"
        );
    }
    Ok(())
}

fn build_backend(cfg: &RelayConfig) -> Arc<dyn ChatBackend> {
    let http = build_http_client(Duration::from_secs(cfg.upstream.connect_timeout_seconds));
    Arc::new(
        AnthropicClient::new(http, cfg.api_key(), &cfg.upstream.model)
            .with_base_url(&cfg.upstream.base_url)
            .with_version(&cfg.upstream.anthropic_version),
    )
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?cfg_path,
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        max_body_bytes = cfg.server.max_body_bytes,
        upstream_base_url = %cfg.upstream.base_url,
        upstream_model = %cfg.upstream.model,
        reported_model = %cfg.relay.reported_model,
        max_tokens_ceiling = cfg.relay.max_tokens_ceiling,
        default_temperature = cfg.relay.default_temperature,
        stream_timeout_ms = ?cfg.relay.stream_timeout_ms,
        api_key_configured = cfg.api_key().is_some(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let relay = Arc::new(ChatRelay::new(
        build_backend(&cfg),
        RelaySettings::from_config(&cfg.relay),
    ));
    let shutdown = CancellationToken::new();
    let state = Arc::new(RelayState {
        relay,
        shutdown: shutdown.clone(),
    });

    let app = build_app(state, &cfg.server);

    tracing::info!(%addr, "chat relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    Ok(())
}

/// Routes plus the HTTP stack. Every error leaving this stack is `{error}` JSON.
fn build_app(state: Arc<RelayState>, server: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "chat relay response sent"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(GlobalConcurrencyLimitLayer::new(server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.http_timeout_seconds),
        ))
        .layer(middleware::map_response(routes::structured_errors))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

/// Resolves on ctrl-c or SIGTERM, then cancels every in-flight relay.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("ctrl-c received; draining chat requests"),
        _ = terminate => tracing::warn!("SIGTERM received; draining chat requests"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::{RelayState, build_app, build_backend, request_id_from_headers};
    use crate::config::{RelayConfig, RelaySettingsConfig, ServerConfig};
    use crate::fake_backend::{FakeBackend, Script};
    use crate::relay::{ChatRelay, RelaySettings};
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderMap, Request, StatusCode};
    use relay_llm::ChatBackend;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn app_with(backend: Arc<FakeBackend>, server: ServerConfig) -> Router {
        let relay = ChatRelay::new(
            backend,
            RelaySettings::from_config(&RelaySettingsConfig::default()),
        );
        let state = Arc::new(RelayState {
            relay: Arc::new(relay),
            shutdown: CancellationToken::new(),
        });
        build_app(state, &server)
    }

    async fn send(app: Router, body: String) -> (StatusCode, HeaderMap, Value) {
        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        (status, headers, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc-123".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc-123");
    }

    #[test]
    fn backend_uses_configured_upstream_model_and_key() {
        let mut cfg = RelayConfig::default();
        assert!(!build_backend(&cfg).credential_configured());

        cfg.upstream.api_key = Some("sk-test".to_string());
        cfg.upstream.model = "claude-custom".to_string();
        let backend = build_backend(&cfg);
        assert!(backend.credential_configured());
        assert_eq!(backend.model(), "claude-custom");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_json_413() {
        let backend = Arc::new(FakeBackend::new(true, Script::Events(vec![])));
        let server = ServerConfig {
            max_body_bytes: 1024,
            ..ServerConfig::default()
        };
        let body = json!({
            "messages": [{ "role": "user", "content": "x".repeat(4096) }]
        })
        .to_string();

        let (status, headers, json_body) = send(app_with(backend.clone(), server), body).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body, json!({ "error": "Invalid request format" }));
        assert!(headers.contains_key("x-request-id"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn http_timeout_is_reported_as_json_and_stops_the_relay() {
        let backend = Arc::new(FakeBackend::new(true, Script::Pending));
        let server = ServerConfig {
            http_timeout_seconds: 1,
            ..ServerConfig::default()
        };

        let (status, _, json_body) = send(
            app_with(backend.clone(), server),
            r#"{"messages":[{"role":"user","content":"hi"}]}"#.to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            json_body,
            json!({ "error": "Failed to get response from Claude" })
        );
        for _ in 0..100 {
            if backend.stream_dropped() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(backend.stream_dropped());
    }
}
