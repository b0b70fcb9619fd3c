//! In-process command/query dispatcher (C15, spec §4.13).

mod commands;

pub use commands::{
    AdvanceTemplateCommand, CancelOperationCommand, CompleteMessageCommand, PauseConversationCommand,
    RecordItemResponseCommand, ResumeConversationCommand, SendMessageCommand, UserInfo,
};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("no handler registered for this request type")]
    NoHandler,
    #[error("mediator error: {0}")]
    Other(String),
}

/// `{success, data?, errors[], statusCode}` (spec §4.13).
#[derive(Clone, Debug)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub errors: Vec<String>,
    pub status_code: u16,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: Vec::new(),
            status_code: 200,
        }
    }

    pub fn not_found(entity_type: &str, id: &str) -> Self {
        Self {
            success: false,
            data: None,
            errors: vec![format!("{entity_type} {id} not found")],
            status_code: 404,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            errors: vec![message.into()],
            status_code: 400,
        }
    }

    /// Used for optimistic-concurrency version mismatches (spec §4.13, §6).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            errors: vec![message.into()],
            status_code: 409,
        }
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            errors: vec![message.into()],
            status_code: 500,
        }
    }
}

/// A request dispatched through the mediator: a command or query with a
/// declared response type.
pub trait Request: Send + Sync + 'static {
    type Response: Send + Sync + 'static;
}

#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: R) -> OperationResult<R::Response>;
}

trait ErasedHandler: Send + Sync {
    fn handle_any<'a>(
        &'a self,
        request: Box<dyn Any + Send>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Box<dyn Any + Send>> + Send + 'a>>;
}

struct ErasedHandlerImpl<R: Request> {
    inner: Arc<dyn RequestHandler<R>>,
}

impl<R: Request> ErasedHandler for ErasedHandlerImpl<R> {
    fn handle_any<'a>(
        &'a self,
        request: Box<dyn Any + Send>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Box<dyn Any + Send>> + Send + 'a>> {
        let request = *request
            .downcast::<R>()
            .unwrap_or_else(|_| panic!("mediator: request type mismatch for registered handler"));
        Box::pin(async move {
            let result = self.inner.handle(request).await;
            Box::new(result) as Box<dyn Any + Send>
        })
    }
}

/// Stateless in-process request dispatcher: handler dependencies
/// (repositories, LLM factory) are the singletons, not the mediator itself
/// (spec §5, §9).
#[derive(Default)]
pub struct Mediator {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R>(&mut self, handler: Arc<dyn RequestHandler<R>>)
    where
        R: Request,
    {
        self.handlers
            .insert(TypeId::of::<R>(), Box::new(ErasedHandlerImpl { inner: handler }));
    }

    pub async fn execute<R>(&self, request: R) -> OperationResult<R::Response>
    where
        R: Request,
    {
        let Some(handler) = self.handlers.get(&TypeId::of::<R>()) else {
            return OperationResult {
                success: false,
                data: None,
                errors: vec![MediatorError::NoHandler.to_string()],
                status_code: 500,
            };
        };
        let boxed = handler.handle_any(Box::new(request)).await;
        *boxed
            .downcast::<OperationResult<R::Response>>()
            .unwrap_or_else(|_| panic!("mediator: response type mismatch for registered handler"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);
    impl Request for Ping {
        type Response = u32;
    }

    struct PingHandler;

    #[async_trait]
    impl RequestHandler<Ping> for PingHandler {
        async fn handle(&self, request: Ping) -> OperationResult<u32> {
            OperationResult::ok(request.0 + 1)
        }
    }

    #[tokio::test]
    async fn registered_handler_is_dispatched() {
        let mut mediator = Mediator::new();
        mediator.register::<Ping>(Arc::new(PingHandler));
        let result = mediator.execute(Ping(41)).await;
        assert!(result.success);
        assert_eq!(result.data, Some(42));
    }

    #[tokio::test]
    async fn unregistered_request_type_yields_no_handler_error() {
        struct Unregistered;
        impl Request for Unregistered {
            type Response = ();
        }

        let mediator = Mediator::new();
        let result = mediator.execute(Unregistered).await;
        assert!(!result.success);
        assert_eq!(result.status_code, 500);
    }

    #[test]
    fn conflict_result_has_409() {
        let result: OperationResult<()> = OperationResult::conflict("version mismatch");
        assert_eq!(result.status_code, 409);
        assert!(!result.success);
    }
}
