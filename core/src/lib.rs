//! # conveyor-core
//!
//! Agent-host orchestrator core: the stateful pieces that sit behind one accepted
//! WebSocket connection and drive a conversation between a browser client, an LLM
//! provider, and a remote tool-execution service.
//!
//! ## Main modules
//!
//! - [`protocol`]: the wire envelope, closed type registry, and per-plane message
//!   shapes (`system`, `control`, `data_in`, `data_out`).
//! - [`auth`]: JWKS fetch/cache and JWT verification.
//! - [`token_exchange`]: OAuth2 client-credentials / RFC 8693 exchange with a
//!   single-flight TTL cache and circuit breaker.
//! - [`rate_limit`]: per-user, per-message-type token buckets.
//! - [`access`]: JWT-claim → tool-group resolution with a hashed-claim cache.
//! - [`connection`]: the `Connection` type and its state machine, owned by the
//!   `ConnectionManager`.
//! - [`router`]: type-indexed handler dispatch with a composable middleware chain.
//! - [`context`]: `ConversationContext` and `ItemExecutionState`, the orchestrator's
//!   in-memory state for one connection.
//! - [`orchestrator`]: the message/widget/flow handlers that mutate `context` and
//!   talk to the [`mediator`].
//! - [`template`]: renders a conversation template item-by-item.
//! - [`agent`]: the ReAct tool-calling loop.
//! - [`tool_exec`]: invokes the remote tool service.
//! - [`senders`]: formats and emits server→client protocol messages.
//! - [`repository`]: the storage abstraction the orchestrator writes/reads through.
//! - [`mediator`]: the in-process command/query dispatcher.
//! - [`cache`]: the generic TTL cache primitive used by `auth`, `token_exchange`,
//!   and `access`.
//! - [`llm`]: the LLM provider interface consumed by `template` and `agent`.
//! - [`message`]: the role-tagged chat message type shared by `llm`, `agent`, and
//!   `context`.

pub mod access;
pub mod agent;
pub mod auth;
pub mod cache;
pub mod connection;
pub mod context;
pub mod llm;
pub mod mediator;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod rate_limit;
pub mod repository;
pub mod router;
pub mod senders;
pub mod template;
pub mod token_exchange;
pub mod tool_exec;

pub use cache::{Cache, CacheError, InMemoryCache};
pub use message::{Message, Role};

/// When running `cargo test -p conveyor-core`, initializes tracing from `RUST_LOG` so
/// unit tests can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use std::sync::Once;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    static INIT: Once = Once::new();

    #[allow(dead_code)]
    pub(crate) fn init() {
        INIT.call_once(|| {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
            let _ = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_test_writer()
                        .with_filter(filter),
                )
                .try_init();
        });
    }
}
