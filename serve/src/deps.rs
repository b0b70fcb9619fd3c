//! Builds the process-wide singletons once at startup (spec §5, §9) and the
//! [`MessageRouter`] every connection shares.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::access::AccessResolver;
use conveyor_core::auth::{HttpJwksSource, JwtVerifier, JwtVerifierConfig};
use conveyor_core::connection::{ConnectionManager, SystemHandler};
use conveyor_core::llm::{HttpLlmClient, LlmClient, MockLlm};
use conveyor_core::mediator::{
    AdvanceTemplateCommand, CompleteMessageCommand, Mediator, RecordItemResponseCommand, SendMessageCommand,
};
use conveyor_core::orchestrator::{AuditHandler, FlowHandler, MessageHandler, OrchestratorDeps, SharedContext, WidgetHandler};
use conveyor_core::rate_limit::RateLimiter;
use conveyor_core::repository::{ConversationRepository, TemplateSource};
use conveyor_core::router::{MessageRouter, RateLimitMiddleware, StateGuardMiddleware};
use conveyor_core::senders::ProtocolSender;
use conveyor_core::tool_exec::{HttpToolExecutor, ToolExecutor};

use crate::commands::{AdvanceTemplateHandler, CompleteMessageHandler, RecordItemResponseHandler, SendMessageHandler};
use crate::storage::{AllowAllPolicySource, InMemoryConversationRepository, InMemoryTemplateSource};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Builds an [`LlmClient`]. Without `LLM_API_KEY` set, falls back to a canned
/// [`MockLlm`] so the server still starts in a local/dev environment (spec §6
/// treats the LLM provider as an external dependency, not something the core
/// ships a default for).
fn build_llm(tool_call_timeout: Duration) -> Arc<dyn LlmClient> {
    match std::env::var("LLM_API_KEY") {
        Ok(api_key) => {
            let base_url = env_string("LLM_BASE_URL", "https://api.openai.com/v1");
            let model = env_string("LLM_MODEL", "gpt-4o-mini");
            Arc::new(HttpLlmClient::new(base_url, api_key, model, tool_call_timeout))
        }
        Err(_) => {
            tracing::warn!("LLM_API_KEY not set, falling back to a canned mock LLM response");
            Arc::new(MockLlm::new("I don't have a configured language model to answer that yet."))
        }
    }
}

fn build_tool_executor(timeout: Duration) -> Arc<dyn ToolExecutor> {
    let base_url = env_string("TOOLS_BASE_URL", "http://127.0.0.1:4000");
    Arc::new(HttpToolExecutor::new(base_url, timeout))
}

fn build_jwt_verifier(config: &config::AppConfig) -> Arc<JwtVerifier> {
    let jwks_url = env_string("JWKS_URL", "http://127.0.0.1:4000/.well-known/jwks.json");
    let verifier_config = JwtVerifierConfig {
        verify_issuer: config.jwt.verify_issuer,
        expected_issuer: config.jwt.expected_issuer.clone(),
        verify_audience: config.jwt.verify_audience,
        expected_audience: config.jwt.expected_audience.clone(),
    };
    Arc::new(JwtVerifier::new(Arc::new(HttpJwksSource::new(jwks_url)), verifier_config))
}

/// Everything [`crate::app::AppState`] needs, assembled once at process
/// startup.
pub struct Runtime {
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<MessageRouter<SharedContext>>,
    pub jwt_verifier: Arc<JwtVerifier>,
    pub access_resolver: Arc<AccessResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub conversations: Arc<ConversationRepository>,
    pub template_source: Arc<dyn TemplateSource>,
    pub config: config::AppConfig,
}

pub fn build_runtime(config: config::AppConfig) -> Runtime {
    let connections = Arc::new(ConnectionManager::new());
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), config.rate_limit_bucket_max_age));
    let jwt_verifier = build_jwt_verifier(&config);
    let access_resolver = Arc::new(AccessResolver::new(Arc::new(AllowAllPolicySource::default()), config.access_resolver_cache_ttl));

    let conversations: Arc<ConversationRepository> = Arc::new(InMemoryConversationRepository::new());
    let template_source: Arc<dyn TemplateSource> = Arc::new(InMemoryTemplateSource::with_default_template());

    let sender = Arc::new(ProtocolSender::new(connections.clone()));
    let llm = build_llm(config.tool_call_timeout);
    let tool_executor = build_tool_executor(config.tool_call_timeout);

    let orchestrator_deps = Arc::new(OrchestratorDeps {
        mediator: Arc::new(build_mediator(conversations.clone(), template_source.clone())),
        sender,
        llm,
        tool_executor,
        template_source: template_source.clone(),
        conversations: conversations.clone(),
        agent_settings: config.agent.clone(),
    });

    let mut router: MessageRouter<SharedContext> = MessageRouter::new();
    router.use_middleware(Arc::new(RateLimitMiddleware::new(rate_limiter.clone())));
    router.use_middleware(Arc::new(StateGuardMiddleware));

    let message_handler: Arc<dyn conveyor_core::router::Handler<SharedContext>> = Arc::new(MessageHandler::new(orchestrator_deps.clone()));
    let widget_handler: Arc<dyn conveyor_core::router::Handler<SharedContext>> = Arc::new(WidgetHandler::new(orchestrator_deps.clone()));
    let flow_handler: Arc<dyn conveyor_core::router::Handler<SharedContext>> = Arc::new(FlowHandler::new(orchestrator_deps.clone()));
    let system_handler: Arc<dyn conveyor_core::router::Handler<SharedContext>> = Arc::new(SystemHandler::new(connections.clone(), conversations.clone()));

    router.register("data.message.send", message_handler);
    router.register("data.response.submit", widget_handler);
    router.register("control.flow.start", flow_handler.clone());
    router.register("control.flow.pause", flow_handler.clone());
    router.register("control.flow.resume", flow_handler.clone());
    router.register("control.conversation.pause", flow_handler.clone());
    router.register("control.conversation.resume", flow_handler.clone());
    router.register("control.conversation.cancel", flow_handler);
    router.register("system.ping", system_handler.clone());
    router.register("system.pong", system_handler.clone());
    router.register("system.connection.resume", system_handler);

    let audit_handler: Arc<dyn conveyor_core::router::Handler<SharedContext>> = Arc::new(AuditHandler);
    router.register("data.audit.events", audit_handler.clone());
    router.register("data.tool.result", audit_handler);

    Runtime {
        connections,
        router: Arc::new(router),
        jwt_verifier,
        access_resolver,
        rate_limiter,
        conversations,
        template_source,
        config,
    }
}

/// Registers the command handlers the orchestrator handlers dispatch through
/// the mediator, all backed by the bundled in-memory repository (spec §4.13).
fn build_mediator(conversations: Arc<ConversationRepository>, template_source: Arc<dyn TemplateSource>) -> Mediator {
    let mut mediator = Mediator::new();
    mediator.register::<SendMessageCommand>(Arc::new(SendMessageHandler::new(conversations.clone())));
    mediator.register::<CompleteMessageCommand>(Arc::new(CompleteMessageHandler::new(conversations.clone())));
    mediator.register::<RecordItemResponseCommand>(Arc::new(RecordItemResponseHandler::new(conversations.clone())));
    mediator.register::<AdvanceTemplateCommand>(Arc::new(AdvanceTemplateHandler::new(conversations, template_source)));
    mediator
}
