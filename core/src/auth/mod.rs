//! JWKS fetch/cache and JWT verification (C2, spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Roles present in `realm_access.roles` that never represent an application
/// permission and are always stripped (spec §4.2).
const ROLE_DENY_LIST_EXACT: &[&str] = &["offline_access", "uma_authorization"];
const ROLE_DENY_LIST_PREFIX: &str = "default-roles-";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token signature invalid")]
    UnauthenticatedSignature,
    #[error("token expired")]
    UnauthenticatedExpired,
    #[error("token issuer did not match")]
    UnauthenticatedIssuer,
    #[error("token audience did not match")]
    UnauthenticatedAudience,
    #[error("token malformed: {0}")]
    UnauthenticatedMalformed(String),
    #[error("signing key {0} not found after refresh")]
    KeyNotFound(String),
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("auth error: {0}")]
    Other(String),
}

/// Verified claims, with roles already deny-list-filtered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// The full claim set, used by the access resolver's `jsonPath` matchers
    /// (spec §4.5) — includes volatile fields the access resolver strips
    /// itself before hashing.
    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

fn filter_roles(roles: Vec<String>) -> Vec<String> {
    roles
        .into_iter()
        .filter(|r| !ROLE_DENY_LIST_EXACT.contains(&r.as_str()) && !r.starts_with(ROLE_DENY_LIST_PREFIX))
        .collect()
}

#[derive(Clone, Debug)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

/// Fetches a JWKS document over HTTP. Kept as a trait so tests can supply a
/// fixed key set without a network call.
#[async_trait::async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<(String, String, String)>, AuthError>;
}

pub struct HttpJwksSource {
    client: reqwest::Client,
    jwks_url: String,
}

impl HttpJwksSource {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            jwks_url: jwks_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<Vec<(String, String, String)>, AuthError> {
        #[derive(Deserialize)]
        struct JwksKey {
            kid: String,
            n: String,
            e: String,
        }
        #[derive(Deserialize)]
        struct JwksDoc {
            keys: Vec<JwksKey>,
        }

        let doc: JwksDoc = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::JwksFetch(e.to_string()))?;

        Ok(doc.keys.into_iter().map(|k| (k.kid, k.n, k.e)).collect())
    }
}

#[derive(Clone)]
pub struct JwtVerifierConfig {
    pub verify_issuer: bool,
    pub expected_issuer: String,
    pub verify_audience: bool,
    pub expected_audience: Vec<String>,
}

/// Verifies RS256-signed bearer tokens against a JWKS fetched lazily and
/// cached in memory (spec §4.2). The `kid → key` map is process-wide and
/// shared across connections (spec §5, §9).
pub struct JwtVerifier {
    source: Arc<dyn JwksSource>,
    keys: DashMap<String, Jwk>,
    refresh_lock: Mutex<()>,
    config: JwtVerifierConfig,
}

impl JwtVerifier {
    pub fn new(source: Arc<dyn JwksSource>, config: JwtVerifierConfig) -> Self {
        Self {
            source,
            keys: DashMap::new(),
            refresh_lock: Mutex::new(()),
            config,
        }
    }

    pub fn public_key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys
            .get(kid)
            .map(|jwk| DecodingKey::from_rsa_components(&jwk.n, &jwk.e).ok())
            .flatten()
    }

    /// One-shot, lock-protected refresh: only one task actually hits the
    /// network; everyone else waits for it and then re-reads the map.
    async fn refresh(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let fetched = self.source.fetch().await?;
        self.keys.clear();
        for (kid, n, e) in fetched {
            self.keys.insert(kid.clone(), Jwk { kid, n, e });
        }
        Ok(())
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::UnauthenticatedMalformed(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::UnauthenticatedMalformed("missing kid".into()))?;

        if !self.keys.contains_key(&kid) {
            self.refresh().await?;
            if !self.keys.contains_key(&kid) {
                return Err(AuthError::KeyNotFound(kid));
            }
        }

        let decoding_key = self
            .public_key(&kid)
            .ok_or_else(|| AuthError::KeyNotFound(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.validate_aud = false; // audience checked manually below (set semantics)
        validation.validate_nbf = true;
        if self.config.verify_issuer {
            validation.set_issuer(&[self.config.expected_issuer.clone()]);
        }

        let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::UnauthenticatedExpired,
                ErrorKind::InvalidIssuer => AuthError::UnauthenticatedIssuer,
                ErrorKind::InvalidSignature => AuthError::UnauthenticatedSignature,
                _ => AuthError::UnauthenticatedMalformed(e.to_string()),
            }
        })?;

        let mut claims = data.claims;

        if self.config.verify_audience {
            let configured: std::collections::HashSet<&str> =
                self.config.expected_audience.iter().map(|s| s.as_str()).collect();
            let token_aud: Vec<String> = match &claims.aud {
                Some(serde_json::Value::String(s)) => vec![s.clone()],
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            if !token_aud.iter().any(|a| configured.contains(a.as_str())) {
                return Err(AuthError::UnauthenticatedAudience);
            }
        }

        let roles = claims
            .raw
            .get("realm_access")
            .and_then(|v| v.get("roles"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        claims.roles = filter_roles(roles);

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_deny_list_filters_offline_and_default_roles() {
        let roles = vec![
            "offline_access".to_string(),
            "uma_authorization".to_string(),
            "default-roles-myrealm".to_string(),
            "app-user".to_string(),
        ];
        let filtered = filter_roles(roles);
        assert_eq!(filtered, vec!["app-user".to_string()]);
    }

    struct EmptyJwks;

    #[async_trait::async_trait]
    impl JwksSource for EmptyJwks {
        async fn fetch(&self) -> Result<Vec<(String, String, String)>, AuthError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_without_network_call() {
        let verifier = JwtVerifier::new(
            Arc::new(EmptyJwks),
            JwtVerifierConfig {
                verify_issuer: false,
                expected_issuer: String::new(),
                verify_audience: false,
                expected_audience: Vec::new(),
            },
        );
        let result = verifier.verify("not-a-jwt").await;
        assert!(matches!(result, Err(AuthError::UnauthenticatedMalformed(_))));
    }

    #[tokio::test]
    async fn unknown_kid_with_empty_jwks_reports_key_not_found() {
        // A syntactically valid but unsigned-with-unknown-key header triggers a
        // refresh; since the fake source returns no keys, the kid is still
        // absent afterwards.
        let verifier = JwtVerifier::new(
            Arc::new(EmptyJwks),
            JwtVerifierConfig {
                verify_issuer: false,
                expected_issuer: String::new(),
                verify_audience: false,
                expected_audience: Vec::new(),
            },
        );
        // Construct a header-only "token" with a kid but garbage signature;
        // decode_header will succeed on a loosely-formed JWT shape.
        let fake = format!(
            "{}.{}.sig",
            base64_url(r#"{"alg":"RS256","kid":"abc"}"#),
            base64_url(r#"{"sub":"u1"}"#)
        );
        let result = verifier.verify(&fake).await;
        assert!(result.is_err());
    }

    fn base64_url(s: &str) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        URL_SAFE_NO_PAD.encode(s.as_bytes())
    }
}
