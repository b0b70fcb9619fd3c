//! Axum app: shared state and the `/ws` route (spec §6).

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use conveyor_core::access::AccessResolver;
use conveyor_core::auth::JwtVerifier;
use conveyor_core::connection::ConnectionManager;
use conveyor_core::rate_limit::RateLimiter;
use conveyor_core::repository::{ConversationRepository, TemplateSource};
use conveyor_core::router::MessageRouter;

use crate::connection::handle_socket;
use crate::deps::Runtime;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) router: Arc<MessageRouter<conveyor_core::orchestrator::SharedContext>>,
    pub(crate) jwt_verifier: Arc<JwtVerifier>,
    pub(crate) access_resolver: Arc<AccessResolver>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) conversations: Arc<ConversationRepository>,
    pub(crate) template_source: Arc<dyn TemplateSource>,
    pub(crate) config: Arc<config::AppConfig>,
}

impl From<Runtime> for AppState {
    fn from(runtime: Runtime) -> Self {
        Self {
            connections: runtime.connections,
            router: runtime.router,
            jwt_verifier: runtime.jwt_verifier,
            access_resolver: runtime.access_resolver,
            rate_limiter: runtime.rate_limiter,
            conversations: runtime.conversations,
            template_source: runtime.template_source,
            config: Arc::new(runtime.config),
        }
    }
}

/// Query params on the `/ws` upgrade request (spec §6: `WS /ws?token=<jwt>&conversationId=<id>&definitionId=<id>`).
#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    pub(crate) token: String,
    #[serde(rename = "conversationId")]
    pub(crate) conversation_id: String,
    #[serde(rename = "definitionId")]
    pub(crate) definition_id: Option<String>,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, Query(query): Query<WsQuery>, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}
