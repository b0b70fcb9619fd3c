//! JWT-claim → tool-group resolution with a hashed-claim cache (C5, spec §4.5).

pub mod json_path;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{Cache, InMemoryCache};

/// Claim fields that vary request-to-request without changing identity; the
/// cache key must ignore them (spec §4.5, §8 invariant).
const VOLATILE_FIELDS: &[&str] = &["exp", "iat", "jti", "nbf", "auth_time", "session_state", "nonce"];

#[derive(Debug, Error)]
pub enum AccessResolverError {
    #[error("policy evaluation failed: {0}")]
    PolicyEvaluation(String),
    #[error("access resolver error: {0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatcherOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimMatcher {
    pub json_path: String,
    pub operator: MatcherOperator,
    pub value: serde_json::Value,
}

impl ClaimMatcher {
    fn evaluate(&self, claims: &serde_json::Value) -> Result<bool, AccessResolverError> {
        let actual = json_path::get(claims, &self.json_path);
        let result = match self.operator {
            MatcherOperator::Equals => actual == Some(&self.value),
            MatcherOperator::NotEquals => actual != Some(&self.value),
            MatcherOperator::In => match actual {
                Some(v) => self
                    .value
                    .as_array()
                    .map(|arr| arr.contains(v))
                    .unwrap_or(false),
                None => false,
            },
            MatcherOperator::NotIn => match actual {
                Some(v) => !self
                    .value
                    .as_array()
                    .map(|arr| arr.contains(v))
                    .unwrap_or(false),
                None => true,
            },
            MatcherOperator::Contains => match (actual.and_then(|v| v.as_array()), &self.value) {
                (Some(arr), needle) => arr.contains(needle),
                (None, _) => actual
                    .and_then(|v| v.as_str())
                    .zip(self.value.as_str())
                    .map(|(s, needle)| s.contains(needle))
                    .unwrap_or(false),
            },
            MatcherOperator::StartsWith => actual
                .and_then(|v| v.as_str())
                .zip(self.value.as_str())
                .map(|(s, prefix)| s.starts_with(prefix))
                .unwrap_or(false),
            MatcherOperator::EndsWith => actual
                .and_then(|v| v.as_str())
                .zip(self.value.as_str())
                .map(|(s, suffix)| s.ends_with(suffix))
                .unwrap_or(false),
            MatcherOperator::Matches => {
                let (Some(s), Some(pattern)) = (actual.and_then(|v| v.as_str()), self.value.as_str()) else {
                    return Ok(false);
                };
                let re = Regex::new(pattern)
                    .map_err(|e| AccessResolverError::PolicyEvaluation(e.to_string()))?;
                re.is_match(s)
            }
        };
        Ok(result)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: String,
    pub name: String,
    pub claim_matchers: Vec<ClaimMatcher>,
    pub allowed_group_ids: Vec<String>,
    pub priority: i32,
    pub active: bool,
}

/// Source of active policies; implemented against whatever store holds
/// `AccessPolicy` admin entities (out of core scope, spec §1).
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    async fn active_policies(&self) -> Result<Vec<AccessPolicy>, AccessResolverError>;
    /// Groups currently active in the group projection; the resolved set is
    /// intersected with this (spec §4.5).
    async fn active_group_ids(&self) -> Result<BTreeSet<String>, AccessResolverError>;
}

fn canonical_claims_key(claims: &serde_json::Value) -> String {
    let mut map = claims.as_object().cloned().unwrap_or_default();
    for field in VOLATILE_FIELDS {
        map.remove(*field);
    }
    let canonical = serde_json::Value::Object(map);
    // `serde_json::Value`'s `Object` is a `BTreeMap` by default in this
    // workspace's serde_json features, so key order is already canonical.
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolves the tool-group set granted by a claim set, caching by a hash of
/// the canonicalized claims (spec §4.5). One instance is a process-wide
/// singleton (spec §5, §9).
pub struct AccessResolver {
    policy_source: Arc<dyn PolicySource>,
    cache: InMemoryCache<String, BTreeSet<String>>,
    ttl: Duration,
}

impl AccessResolver {
    pub fn new(policy_source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        Self {
            policy_source,
            cache: InMemoryCache::new(),
            ttl,
        }
    }

    pub async fn resolve_groups(
        &self,
        claims: &serde_json::Value,
    ) -> Result<BTreeSet<String>, AccessResolverError> {
        let key = canonical_claims_key(claims);

        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let policies = self.policy_source.active_policies().await?;
        let active_groups = self.policy_source.active_group_ids().await?;

        let mut sorted = policies;
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut resolved: BTreeSet<String> = BTreeSet::new();
        for policy in sorted.iter().filter(|p| p.active) {
            let matches = policy.claim_matchers.iter().all(|matcher| {
                matcher.evaluate(claims).unwrap_or_else(|e| {
                    tracing::warn!(policy = %policy.id, error = %e, "policy evaluation failed, treating as non-matching");
                    false
                })
            });
            if matches {
                resolved.extend(policy.allowed_group_ids.iter().cloned());
            }
        }

        let resolved: BTreeSet<String> = resolved.intersection(&active_groups).cloned().collect();

        let _ = self.cache.set(key, resolved.clone(), Some(self.ttl)).await;
        Ok(resolved)
    }

    /// Admin operation: drop every cached resolution (spec §4.5, §8 scenario 6).
    pub async fn invalidate_all(&self) {
        let _ = self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedPolicies {
        policies: Vec<AccessPolicy>,
        groups: BTreeSet<String>,
    }

    #[async_trait::async_trait]
    impl PolicySource for FixedPolicies {
        async fn active_policies(&self) -> Result<Vec<AccessPolicy>, AccessResolverError> {
            Ok(self.policies.clone())
        }
        async fn active_group_ids(&self) -> Result<BTreeSet<String>, AccessResolverError> {
            Ok(self.groups.clone())
        }
    }

    fn policy(id: &str, json_path: &str, value: serde_json::Value, groups: &[&str]) -> AccessPolicy {
        AccessPolicy {
            id: id.to_string(),
            name: id.to_string(),
            claim_matchers: vec![ClaimMatcher {
                json_path: json_path.to_string(),
                operator: MatcherOperator::Equals,
                value,
            }],
            allowed_group_ids: groups.iter().map(|s| s.to_string()).collect(),
            priority: 0,
            active: true,
        }
    }

    #[tokio::test]
    async fn matching_policy_contributes_its_groups() {
        let source = FixedPolicies {
            policies: vec![policy("p1", "role", json!("admin"), &["g1", "g2"])],
            groups: ["g1", "g2"].into_iter().map(String::from).collect(),
        };
        let resolver = AccessResolver::new(Arc::new(source), Duration::from_secs(300));
        let claims = json!({"role": "admin", "exp": 123});
        let groups = resolver.resolve_groups(&claims).await.unwrap();
        assert_eq!(groups, ["g1", "g2"].into_iter().map(String::from).collect());
    }

    #[tokio::test]
    async fn result_is_intersected_with_active_groups() {
        let source = FixedPolicies {
            policies: vec![policy("p1", "role", json!("admin"), &["g1", "g2"])],
            groups: ["g1"].into_iter().map(String::from).collect(),
        };
        let resolver = AccessResolver::new(Arc::new(source), Duration::from_secs(300));
        let claims = json!({"role": "admin"});
        let groups = resolver.resolve_groups(&claims).await.unwrap();
        assert_eq!(groups, ["g1"].into_iter().map(String::from).collect());
    }

    #[tokio::test]
    async fn claims_differing_only_in_volatile_fields_share_cache_key() {
        let claims_a = json!({"role": "x", "exp": 1, "jti": "a"});
        let claims_b = json!({"role": "x", "exp": 2, "jti": "b"});
        assert_eq!(canonical_claims_key(&claims_a), canonical_claims_key(&claims_b));
    }

    #[tokio::test]
    async fn invalidate_all_forces_recomputation() {
        let source = FixedPolicies {
            policies: vec![policy("p1", "role", json!("admin"), &["g1"])],
            groups: ["g1"].into_iter().map(String::from).collect(),
        };
        let resolver = AccessResolver::new(Arc::new(source), Duration::from_secs(300));
        let claims = json!({"role": "admin"});
        let _ = resolver.resolve_groups(&claims).await.unwrap();
        resolver.invalidate_all().await;
        let key = canonical_claims_key(&claims);
        assert!(resolver.cache.get(&key).await.is_none());
    }
}
