//! Core data structures shared by the authentication and admission components.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::ValidationError;

/// How a principal proved its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Token,
    ApiKey,
}

/// Authenticated identity derived from a validated credential
///
/// Built per request and never persisted. `attributes` carries claims the
/// gateway does not interpret (group identifiers and the like) so that
/// downstream services still see them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject identifier, never empty
    pub subject_id: String,

    pub email: Option<String>,

    pub roles: BTreeSet<String>,

    pub permissions: BTreeSet<String>,

    /// Credential expiry (if applicable)
    pub expires_at: Option<DateTime<Utc>>,

    pub auth_method: AuthMethod,

    /// Opaque claims preserved from the credential
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Principal {
    /// Check whether the principal holds a role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Check whether the principal holds a permission verbatim
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Whether the credential is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }
}

/// A reachable downstream instance and its operational metadata
///
/// Several endpoints may share a `service_name`; the pair
/// (`service_name`, `base_url`) identifies one entry. Every field except the
/// name and URL has a default so that configuration files and registration
/// requests can stay short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_name: String,

    pub base_url: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_true")]
    pub is_healthy: bool,

    /// Downstream call timeout, enforced by the proxy layer
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retry budget for the proxy layer; never acted on here
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Failure ratio in [0, 1] above which the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// How long an open breaker waits before allowing a trial request
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
}

impl ServiceEndpoint {
    /// Endpoint with default metadata
    pub fn new(service_name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            base_url: base_url.into(),
            health_path: default_health_path(),
            is_healthy: true,
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            circuit_breaker_enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
        }
    }

    /// Identity used for breaker lookup: `name@url`
    pub fn key(&self) -> String {
        endpoint_key(&self.service_name, &self.base_url)
    }

    /// Check the fields a registration must get right: a name, an absolute
    /// http(s) URL with a host, and a threshold within [0, 1]
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service_name.trim().is_empty() {
            return Err(ValidationError::ServiceNameRequired);
        }

        let invalid = |reason: &str| ValidationError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: reason.to_string(),
        };

        let url = Url::parse(&self.base_url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("host is required"));
        }

        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ValidationError::InvalidFailureThreshold(self.failure_threshold));
        }

        Ok(())
    }

    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }
}

pub fn endpoint_key(service_name: &str, base_url: &str) -> String {
    format!("{}@{}", service_name, base_url)
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_count() -> u32 {
    3
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn principal() -> Principal {
        Principal {
            subject_id: "user-1".to_string(),
            email: Some("user@example.com".to_string()),
            roles: ["admin".to_string()].into_iter().collect(),
            permissions: ["users:read".to_string()].into_iter().collect(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            auth_method: AuthMethod::Token,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_role_and_permission_lookup() {
        let p = principal();
        assert!(p.has_role("admin"));
        assert!(!p.has_role("user"));
        assert!(p.has_permission("users:read"));
        assert!(!p.has_permission("users:write"));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let mut p = principal();
        let now = Utc::now();
        p.expires_at = Some(now);
        assert!(p.is_expired_at(now));
        p.expires_at = None;
        assert!(!p.is_expired_at(now));
    }

    #[test]
    fn test_endpoint_defaults_from_yaml() {
        let endpoint: ServiceEndpoint = serde_yaml::from_str(
            "service_name: Billing\nbase_url: https://host:9/\ncooldown: 5s\n",
        )
        .unwrap();

        assert_eq!(endpoint.key(), "Billing@https://host:9/");
        assert!(endpoint.is_healthy);
        assert!(endpoint.circuit_breaker_enabled);
        assert_eq!(endpoint.health_path, "/health");
        assert_eq!(endpoint.retry_count, 3);
        assert_eq!(endpoint.failure_threshold, 0.5);
        assert_eq!(endpoint.cooldown, std::time::Duration::from_secs(5));
    }
}
