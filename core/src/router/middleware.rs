//! Built-in middlewares: rate limiting and connection-state guarding
//! (spec §4.7).

use std::sync::Arc;

use async_trait::async_trait;

use super::{MessageRouter, RouterError};
use crate::connection::Connection;
use crate::protocol::InboundMessage;
use crate::rate_limit::RateLimiter;

/// Continuation passed to a middleware; calling `run` proceeds to the next
/// middleware in the chain, or the handler if none remain.
pub struct Next<'a, Ctx: Send + Sync> {
    pub(super) router: &'a MessageRouter<Ctx>,
    pub(super) index: usize,
    pub(super) connection: &'a Connection,
    pub(super) ctx: &'a Ctx,
    pub(super) handler: Option<Arc<dyn super::Handler<Ctx>>>,
}

impl<'a, Ctx: Send + Sync> Next<'a, Ctx> {
    pub async fn run(self, message: InboundMessage) -> Result<(), RouterError> {
        self.router
            .dispatch(self.index, self.connection, self.ctx, message, self.handler)
            .await
    }
}

#[async_trait]
pub trait Middleware<Ctx: Send + Sync>: Send + Sync {
    async fn handle(
        &self,
        connection: &Connection,
        ctx: &Ctx,
        message: &InboundMessage,
        next: Next<'_, Ctx>,
    ) -> Result<(), RouterError>;
}

/// Short-circuits on limit breach (spec §4.7 middleware 1).
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl<Ctx: Send + Sync> Middleware<Ctx> for RateLimitMiddleware {
    async fn handle(
        &self,
        connection: &Connection,
        _ctx: &Ctx,
        message: &InboundMessage,
        next: Next<'_, Ctx>,
    ) -> Result<(), RouterError> {
        let type_name = message.type_name();
        if let Some(Err(exceeded)) = self.limiter.check(&connection.user_id, type_name) {
            return Err(RouterError::RateLimited {
                retry_after_ms: exceeded.retry_after_ms,
            });
        }
        next.run(message.clone()).await
    }
}

/// Rejects messages whose type is not valid in the connection's current state
/// (spec §4.7 middleware 2, §4.8 input acceptance table).
pub struct StateGuardMiddleware;

#[async_trait]
impl<Ctx: Send + Sync> Middleware<Ctx> for StateGuardMiddleware {
    async fn handle(
        &self,
        connection: &Connection,
        _ctx: &Ctx,
        message: &InboundMessage,
        next: Next<'_, Ctx>,
    ) -> Result<(), RouterError> {
        // Connection-level gating only (spec §4.6 input acceptance); the
        // finer-grained orchestrator-state acceptance table (spec §4.8) is
        // enforced in the message/widget handlers themselves, since the
        // router only sees `Connection`, not `ConversationContext` (spec §9
        // cyclic-reference note).
        if !connection.accepts_inbound() {
            return Err(RouterError::InvalidState(message.type_name().to_string()));
        }
        next.run(message.clone()).await
    }
}
