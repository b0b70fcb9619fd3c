//! OAuth2 client-credentials and RFC 8693 token exchange, with a single-flight
//! TTL cache and circuit breaker (C3, spec §4.3).

mod breaker;

pub use breaker::{CircuitBreaker, CircuitState};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum TokenExchangeError {
    #[error("upstream token service unavailable (breaker open)")]
    UpstreamUnavailable,
    #[error("token fetch failed: {0}")]
    FetchFailed(String),
    #[error("token exchange error: {0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub grant_type: String,
    pub subject_or_audience: String,
    pub client_id: String,
}

impl TokenKey {
    fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: SystemTime,
    pub scope: Option<String>,
}

impl AccessToken {
    fn is_stale(&self, buffer: Duration) -> bool {
        let now = SystemTime::now();
        match self.expires_at.checked_sub(buffer) {
            Some(threshold) => now >= threshold,
            None => true,
        }
    }
}

/// The actual network call that produces a fresh token. Implementations wrap
/// an HTTP client-credentials or RFC 8693 exchange POST.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, key: &TokenKey) -> Result<AccessToken, TokenExchangeError>;
}

/// Single-flight, TTL-cached, circuit-breaker-guarded wrapper around a
/// [`TokenFetcher`]. One instance is a process-wide singleton shared by every
/// connection (spec §5, §9).
pub struct TokenExchangeCache {
    entries: DashMap<u64, AccessToken>,
    in_flight: DashMap<u64, Arc<Mutex<()>>>,
    breaker: CircuitBreaker,
    buffer: Duration,
}

impl TokenExchangeCache {
    pub fn new(buffer: Duration, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            breaker: CircuitBreaker::new(failure_threshold, recovery_timeout),
            buffer,
        }
    }

    /// Returns a fresh token for `key`, fetching via `fetcher` if the cached
    /// entry is missing or stale. Exactly one in-flight fetch happens per key
    /// at a time; concurrent callers wait on the same lock and then re-read
    /// the cache (spec §4.3, §8 boundary behavior).
    pub async fn get_or_fetch(
        &self,
        key: &TokenKey,
        fetcher: &dyn TokenFetcher,
    ) -> Result<AccessToken, TokenExchangeError> {
        let cache_key = key.cache_key();

        if let Some(entry) = self.entries.get(&cache_key) {
            if !entry.is_stale(self.buffer) {
                return Ok(entry.clone());
            }
        }

        if !self.breaker.allow_request() {
            return Err(TokenExchangeError::UpstreamUnavailable);
        }

        let lock = self
            .in_flight
            .entry(cache_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => None,
        };

        let result = match guard {
            Some(_guard) => self.do_fetch(key, cache_key, fetcher).await,
            None => {
                // Someone else is fetching; wait a bounded time then re-check
                // the cache before falling back to fetching ourselves.
                sleep(Duration::from_millis(200)).await;
                if let Some(entry) = self.entries.get(&cache_key) {
                    if !entry.is_stale(self.buffer) {
                        return Ok(entry.clone());
                    }
                }
                self.do_fetch(key, cache_key, fetcher).await
            }
        };

        self.in_flight.remove(&cache_key);
        result
    }

    async fn do_fetch(
        &self,
        key: &TokenKey,
        cache_key: u64,
        fetcher: &dyn TokenFetcher,
    ) -> Result<AccessToken, TokenExchangeError> {
        match fetcher.fetch(key).await {
            Ok(token) => {
                self.breaker.record_success();
                self.entries.insert(cache_key, token.clone());
                Ok(token)
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!(error = %e, "token exchange fetch failed");
                Err(e)
            }
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}
