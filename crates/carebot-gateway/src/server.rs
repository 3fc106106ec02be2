//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use carebot_agent::Assistant;
use carebot_core::config::GatewayConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub assistant: Assistant,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(assistant: Assistant) -> Self {
        Self {
            assistant,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
        .allow_headers(Any);
    // Restrict origins via env var, e.g. CAREBOT_CORS_ORIGINS=https://care.example.org
    let cors = match std::env::var("CAREBOT_CORS_ORIGINS") {
        Ok(origins) => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                .collect();
            cors.allow_origin(origins)
        }
        Err(_) => cors.allow_origin(Any),
    };

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route(
            "/chats",
            get(super::routes::list_chats).post(super::routes::create_chat),
        )
        .route(
            "/chats/{chat_id}",
            get(super::routes::get_chat).post(super::routes::converse),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, assistant: Assistant) -> anyhow::Result<()> {
    let app = build_router(AppState::new(assistant));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
