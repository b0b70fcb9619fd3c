//! Process-wide runtime settings (spec §6 Configuration table).
//!
//! Loaded once at startup from the environment (after [`load_and_apply`] has merged
//! `.env` and XDG `config.toml` into the process env) and handed to every component
//! as a plain, cloneable value. Nothing here is reloaded at request time.

use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Per-message-type rate-limit bucket configuration (spec §4.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_seconds: u64,
}

/// Agent (ReAct) loop tuning (spec §4.10, §6).
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub max_tool_calls_per_iteration: u32,
    pub timeout: Duration,
    pub stop_on_error: bool,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

/// Heartbeat tuning (spec §4.6).
#[derive(Clone, Debug)]
pub struct HeartbeatSettings {
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
}

/// Circuit-breaker tuning shared by the token-exchange cache (spec §4.3).
#[derive(Clone, Debug)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

/// JWT hardening toggles (spec §4.2).
#[derive(Clone, Debug)]
pub struct JwtSettings {
    pub verify_issuer: bool,
    pub expected_issuer: String,
    pub verify_audience: bool,
    pub expected_audience: Vec<String>,
}

/// Full process-wide configuration, built once from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub agent: AgentSettings,
    pub heartbeat: HeartbeatSettings,
    pub rate_limits: Vec<(String, RateLimitRule)>,
    pub token_exchange_cache_buffer: Duration,
    pub circuit_breaker: CircuitBreakerSettings,
    pub access_resolver_cache_ttl: Duration,
    pub jwt: JwtSettings,
    pub tool_call_timeout: Duration,
    pub rate_limit_bucket_max_age: Duration,
}

impl AppConfig {
    /// Builds settings from the process environment, falling back to the spec defaults
    /// (§6) for anything unset. Call [`crate::load_and_apply`] first so `.env`/XDG
    /// values are visible here.
    pub fn from_env() -> Self {
        let default_rate_limits = vec![
            (
                "data.message.send".to_string(),
                RateLimitRule {
                    max_requests: env_u64("RATE_LIMIT_MESSAGE_SEND_MAX", 10) as u32,
                    window_seconds: env_u64("RATE_LIMIT_MESSAGE_SEND_WINDOW_SECONDS", 60),
                },
            ),
            (
                "data.response.submit".to_string(),
                RateLimitRule {
                    max_requests: env_u64("RATE_LIMIT_RESPONSE_SUBMIT_MAX", 30) as u32,
                    window_seconds: env_u64("RATE_LIMIT_RESPONSE_SUBMIT_WINDOW_SECONDS", 60),
                },
            ),
            (
                "data.audit.events".to_string(),
                RateLimitRule {
                    max_requests: env_u64("RATE_LIMIT_AUDIT_EVENTS_MAX", 10) as u32,
                    window_seconds: env_u64("RATE_LIMIT_AUDIT_EVENTS_WINDOW_SECONDS", 60),
                },
            ),
            (
                "data.tool.result".to_string(),
                RateLimitRule {
                    max_requests: env_u64("RATE_LIMIT_TOOL_RESULT_MAX", 20) as u32,
                    window_seconds: env_u64("RATE_LIMIT_TOOL_RESULT_WINDOW_SECONDS", 60),
                },
            ),
        ];

        AppConfig {
            agent: AgentSettings {
                max_iterations: env_u64("AGENT_MAX_ITERATIONS", 10) as u32,
                max_tool_calls_per_iteration: env_u64("AGENT_MAX_TOOL_CALLS_PER_ITERATION", 5)
                    as u32,
                timeout: Duration::from_secs(env_u64("AGENT_TIMEOUT_SECONDS", 300)),
                stop_on_error: env_bool("AGENT_STOP_ON_ERROR", false),
                retry_on_error: env_bool("AGENT_RETRY_ON_ERROR", true),
                max_retries: env_u64("AGENT_MAX_RETRIES", 2) as u32,
            },
            heartbeat: HeartbeatSettings {
                ping_interval: Duration::from_secs(env_u64("PING_INTERVAL_SECONDS", 30)),
                max_missed_pongs: env_u64("MAX_MISSED_PONGS", 2) as u32,
            },
            rate_limits: default_rate_limits,
            token_exchange_cache_buffer: Duration::from_secs(env_u64(
                "TOKEN_EXCHANGE_CACHE_BUFFER_SECONDS",
                60,
            )),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: env_u64("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5) as u32,
                recovery_timeout: Duration::from_secs(env_u64(
                    "CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECONDS",
                    30,
                )),
            },
            access_resolver_cache_ttl: Duration::from_secs(env_u64(
                "ACCESS_RESOLVER_CACHE_TTL_SECONDS",
                300,
            )),
            jwt: JwtSettings {
                verify_issuer: env_bool("JWT_VERIFY_ISSUER", false),
                expected_issuer: env_string("JWT_EXPECTED_ISSUER", ""),
                verify_audience: env_bool("JWT_VERIFY_AUDIENCE", false),
                expected_audience: env_list("JWT_EXPECTED_AUDIENCE"),
            },
            tool_call_timeout: Duration::from_secs(env_u64("TOOL_CALL_TIMEOUT_SECONDS", 30)),
            rate_limit_bucket_max_age: Duration::from_secs(env_u64(
                "RATE_LIMIT_BUCKET_MAX_AGE_SECONDS",
                3600,
            )),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Safe because every env_* helper above falls back to the spec default
        // when the variable is unset; an empty environment yields the same
        // settings as calling `from_env()` would after a clean process start.
        Self::from_env()
    }
}
