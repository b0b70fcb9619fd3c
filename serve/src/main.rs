//! Standalone entrypoint: loads configuration from the environment and
//! serves the orchestrator's `/ws` endpoint (spec §6).

use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = config::load_and_apply("conveyor", None) {
        tracing::warn!(error = %e, "failed to load XDG/.env configuration, continuing with process env only");
    }

    let addr = env::var("WS_ADDR").ok();
    let config = config::AppConfig::from_env();
    serve::run_serve(addr.as_deref(), config).await
}
