use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::config::RateLimitConfig;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router: the WebSocket endpoint and a health check.
/// The router must be served with `ConnectInfo<SocketAddr>` when rate
/// limiting is enabled.
pub fn build_router(state: AppState, rate_limit: &RateLimitConfig) -> Router {
    // WebSocket endpoint (identity via query param)
    let mut ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    if rate_limit.enabled {
        // per_second(n) replenishes one token every n seconds
        let governor_config = Arc::new(
            GovernorConfigBuilder::default()
                .key_extractor(PeerIpKeyExtractor)
                .per_second(rate_limit.per_second.max(1))
                .burst_size(rate_limit.burst_size.max(1))
                .finish()
                .expect("Failed to build governor config"),
        );
        let governor_limiter = governor_config.limiter().clone();

        // Spawn background task to clean up rate limiter state
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                governor_limiter.retain_recent();
            }
        });

        ws_routes = ws_routes.layer(GovernorLayer {
            config: governor_config,
        });
    }

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
