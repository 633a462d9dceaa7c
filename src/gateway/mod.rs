//! HTTP gateway exposing the OpenAI-compatible surface.
//!
//! One axum router, three routes: `/v1/chat/completions`,
//! `/v1/models`, and `/health`. Everything stateful hangs off
//! [`AppState`]: the upstream client (which owns the outbound HTTP
//! clients and the anonymous token cache) and the trigger sentinel in
//! effect for this process.

pub mod openai;

use anyhow::Result;
use axum::{
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::auth::AnonymousTokenCache;
use crate::config::{Config, HttpClients};
use crate::toolcall::DEFAULT_TRIGGER_SIGNAL;
use crate::upstream::ZaiClient;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub zai: Arc<ZaiClient>,
    /// Sentinel threaded through rewriting, draining and extraction.
    pub trigger_signal: Arc<str>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let http = Arc::new(HttpClients::new(config.proxy_url.as_deref()));
        let tokens = Arc::new(AnonymousTokenCache::new());
        Self {
            zai: Arc::new(ZaiClient::new(http, tokens)),
            trigger_signal: Arc::from(DEFAULT_TRIGGER_SIGNAL),
        }
    }
}

/// Bind and serve the gateway until the process is stopped.
pub async fn run_gateway(config: &Config) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual = listener.local_addr()?;

    tracing::info!("listening on http://{actual}");
    if config.proxy_url.is_some() {
        tracing::info!("outbound proxy configured; upstream traffic will be split across paths");
    }

    let state = AppState::new(config);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/v1/models", get(openai::handle_v1_models))
        .route("/v1/chat/completions", post(openai::handle_chat_completions))
        .with_state(state);

    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /health — liveness only, no secrets.
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
