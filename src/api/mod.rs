pub mod error;
mod handlers;
mod socket;
pub mod ws_methods;

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::Bridge;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub shutdown: ShutdownCoordinator,
    /// Keepalive ping interval for every WebSocket; `None` disables pings.
    pub ping_interval: Option<Duration>,
}

impl AppState {
    pub fn new(bridge: Bridge, shutdown: ShutdownCoordinator) -> Self {
        Self {
            bridge,
            shutdown,
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/diagnostics", get(diagnostics))
        .route("/resources/{resource}/commands", post(resource_command))
        .route("/ws/device", get(ws_device))
        .route("/ws/client", get(ws_client))
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
