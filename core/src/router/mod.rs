//! Type-indexed handler dispatch with a composable middleware chain (C7,
//! spec §4.7).

mod middleware;

pub use middleware::{Middleware, Next, RateLimitMiddleware, StateGuardMiddleware};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::connection::Connection;
use crate::protocol::system::{ErrorCategory, ErrorCode, SystemError};
use crate::protocol::{InboundMessage, ProtocolMessage};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("payload did not match schema for {0}")]
    InvalidPayload(String),
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("message type {0} is not valid in the current connection state")]
    InvalidState(String),
    #[error("handler error: {0}")]
    HandlerError(String),
}

impl RouterError {
    /// Translates a router/handler failure into a `system.error` frame (spec §4.7, §7).
    pub fn into_system_error(self) -> SystemError {
        match self {
            RouterError::UnknownMessageType(_) => SystemError::new(
                ErrorCategory::Validation,
                ErrorCode::UnknownMessageType,
                self.to_string(),
                false,
            ),
            RouterError::InvalidPayload(_) => SystemError::new(
                ErrorCategory::Validation,
                ErrorCode::InvalidPayload,
                self.to_string(),
                false,
            ),
            RouterError::RateLimited { retry_after_ms } => SystemError::new(
                ErrorCategory::RateLimit,
                ErrorCode::RateLimitExceeded,
                self.to_string(),
                true,
            )
            .with_retry_after(retry_after_ms),
            RouterError::InvalidState(_) => SystemError::new(
                ErrorCategory::Business,
                ErrorCode::InvalidState,
                self.to_string(),
                true,
            ),
            RouterError::HandlerError(_) => SystemError::new(
                ErrorCategory::Server,
                ErrorCode::HandlerError,
                self.to_string(),
                true,
            ),
        }
    }
}

/// A type-specific handler. `ctx` is left generic over whatever per-connection
/// state the caller threads through (the orchestrator's `ConversationContext`
/// in practice); the router itself only needs `Connection` for state-guard
/// purposes.
#[async_trait]
pub trait Handler<Ctx: Send + Sync>: Send + Sync {
    async fn handle(
        &self,
        connection: &Connection,
        ctx: &Ctx,
        message: InboundMessage,
    ) -> Result<(), RouterError>;
}

/// Holds the `type → Handler` map and the ordered middleware chain. `route`
/// composes middlewares outermost-first around the handler invocation (spec
/// §4.7).
pub struct MessageRouter<Ctx: Send + Sync> {
    handlers: HashMap<&'static str, Arc<dyn Handler<Ctx>>>,
    middlewares: Vec<Arc<dyn Middleware<Ctx>>>,
}

impl<Ctx: Send + Sync> MessageRouter<Ctx> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            middlewares: Vec::new(),
        }
    }

    pub fn register(&mut self, message_type: &'static str, handler: Arc<dyn Handler<Ctx>>) {
        self.handlers.insert(message_type, handler);
    }

    /// Registered outermost-first: the first middleware added wraps every
    /// other middleware and the handler.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware<Ctx>>) {
        self.middlewares.push(middleware);
    }

    pub async fn route(
        &self,
        connection: &Connection,
        ctx: &Ctx,
        envelope: &ProtocolMessage,
    ) -> Result<(), RouterError> {
        if !crate::protocol::is_registered_type(&envelope.message_type) {
            return Err(RouterError::UnknownMessageType(envelope.message_type.clone()));
        }

        let message = InboundMessage::from_envelope(envelope)
            .ok_or_else(|| RouterError::InvalidPayload(envelope.message_type.clone()))?;

        // Handler lookup is deferred to the terminal dispatch branch so the
        // middleware chain (rate limiting, state guarding) always runs for any
        // registered message type, whether or not a `Handler` backs it yet.
        let handler = self.handlers.get(message.type_name()).cloned();

        self.dispatch(0, connection, ctx, message, handler).await
    }

    fn dispatch<'a>(
        &'a self,
        index: usize,
        connection: &'a Connection,
        ctx: &'a Ctx,
        message: InboundMessage,
        handler: Option<Arc<dyn Handler<Ctx>>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RouterError>> + Send + 'a>> {
        Box::pin(async move {
            match self.middlewares.get(index) {
                Some(middleware) => {
                    let next = Next {
                        router: self,
                        index: index + 1,
                        connection,
                        ctx,
                        handler: handler.clone(),
                    };
                    middleware.handle(connection, ctx, &message, next).await
                }
                None => match handler {
                    Some(handler) => handler.handle(connection, ctx, message).await,
                    None => Err(RouterError::UnknownMessageType(message.type_name().to_string())),
                },
            }
        })
    }
}

impl<Ctx: Send + Sync> Default for MessageRouter<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}
