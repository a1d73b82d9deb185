pub mod auth;
pub mod broker;
mod handler;
pub mod presence;
mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use broker::DeliveryBroker;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use presence::PresenceTracker;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use vellum_core::AppState;
use vellum_models::ConnectionId;

/// Shared state of the WebSocket gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub app: AppState,
    pub broker: Arc<DeliveryBroker>,
    flood: Arc<DefaultKeyedRateLimiter<ConnectionId>>,
}

impl GatewayState {
    pub fn new(app: AppState) -> Self {
        let presence = Arc::new(PresenceTracker::new(
            app.clock.clone(),
            app.config.presence_ttl_seconds,
        ));
        let broker = Arc::new(DeliveryBroker::new(
            presence,
            app.config.outbound_queue_size,
        ));
        let per_second =
            NonZeroU32::new(app.config.inbound_frames_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            app,
            broker,
            flood: Arc::new(RateLimiter::keyed(Quota::per_second(per_second))),
        }
    }

    /// Drop flood-limiter state of idle connections.
    pub fn prune_flood_limits(&self) {
        self.flood.retain_recent();
        self.flood.shrink_to_fit();
    }
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: String,
}

pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(params): Query<GatewayParams>,
) -> Response {
    let claims = match auth::validate_token(&params.token, &state.app.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!("gateway handshake rejected: {e}");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, claims))
}
