//! # Admission Controller
//!
//! Ties the admission pipeline together for a single inbound request:
//!
//! 1. extract a credential (Authorization header first, then the API key header)
//! 2. validate it into a [`Principal`]
//! 3. check the requested resource/action against the principal's grants
//! 4. resolve the target service to one endpoint
//! 5. ask that endpoint's circuit breaker for permission to call it
//!
//! Proxying is the caller's job. The caller reports the downstream result back
//! through [`GatewayAdmissionController::record_outcome`] so the breaker sees it.
//!
//! Every store is constructed here and shared through `Arc`; there is no
//! process-global state.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::api_key::{
    ApiKeyAuthenticator, ApiKeyRecord, ApiKeyRecordWithSecret, CredentialStore, RevokeOutcome,
};
use crate::auth::permissions::PermissionEvaluator;
use crate::auth::token::{has_scheme, strip_bearer, TokenValidator};
use crate::core::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::core::config::GatewayConfig;
use crate::core::error::{AuthError, GatewayError, GatewayResult, NotFoundError, ValidationError};
use crate::core::types::{endpoint_key, Principal, ServiceEndpoint};
use crate::discovery::{RegistryStats, ServiceChangeReceiver, ServiceRegistry};

/// Raw credential material presented with a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Value of the `Authorization` header
    #[serde(default)]
    pub authorization: Option<String>,

    /// Value of the configured API key header
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self {
            authorization: Some(format!("Bearer {}", token.as_ref())),
            api_key: None,
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            authorization: None,
            api_key: Some(key.into()),
        }
    }

    /// Pull credentials out of request headers; non-UTF-8 values are ignored
    pub fn from_headers(headers: &HeaderMap, api_key_header: &str) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            authorization: read(AUTHORIZATION.as_str()),
            api_key: read(api_key_header),
        }
    }
}

/// One admission question: may these credentials call `resource:action` on
/// `service_name`?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    #[serde(default)]
    pub credentials: Credentials,
    pub service_name: String,
    pub resource: String,
    pub action: String,
}

/// A positive admission decision
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub principal: Principal,

    /// Endpoint the request should be proxied to
    pub endpoint: ServiceEndpoint,
}

/// Gateway admission controller
pub struct GatewayAdmissionController {
    config: Arc<GatewayConfig>,
    tokens: TokenValidator,
    credential_store: Arc<CredentialStore>,
    api_keys: ApiKeyAuthenticator,
    permissions: PermissionEvaluator,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl GatewayAdmissionController {
    /// Build every store from configuration, discover static services and
    /// provision the bootstrap key
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let tokens = TokenValidator::new(config.auth.jwt.clone())?;

        let credential_store = Arc::new(CredentialStore::new());
        let api_keys = ApiKeyAuthenticator::new(Arc::clone(&credential_store), &config.auth.api_keys);
        api_keys.provision_bootstrap(&config.auth.api_keys.bootstrap)?;

        let permissions = PermissionEvaluator::new(&config.permissions);

        let registry = Arc::new(ServiceRegistry::new(config.services.clone()));
        let discovered = registry.discover_services();

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        info!(
            services = discovered.len(),
            api_keys = credential_store.len(),
            "Admission controller initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            tokens,
            credential_store,
            api_keys,
            permissions,
            registry,
            breakers,
        })
    }

    /// Resolve presented credentials to a principal
    ///
    /// The Authorization header wins over the API key header. `ApiKey <key>`
    /// and `Bearer <key>` (when the value carries the key prefix) are API keys;
    /// any other Authorization value is a bearer token.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        let authorization = credentials
            .authorization
            .as_deref()
            .filter(|value| !value.trim().is_empty());

        let result = match (authorization, credentials.api_key.as_deref()) {
            (Some(header), _) if has_scheme(header, "apikey") => self.api_keys.validate_api_key(header),
            (Some(header), _) => {
                let presented = strip_bearer(header);
                if self.api_keys.is_key_material(presented) {
                    self.api_keys.validate_api_key(presented)
                } else {
                    self.tokens.validate_token(header)
                }
            }
            (None, Some(key)) if !key.trim().is_empty() => self.api_keys.validate_api_key(key),
            _ => Err(AuthError::CredentialsRequired),
        };

        if let Err(e) = &result {
            debug!(reason = e.reason(), "Authentication failed");
        }
        result
    }

    /// Whether `principal` may perform `action` on `resource`
    pub fn authorize(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        self.permissions.authorize(principal, resource, action)
    }

    /// Pick the endpoint for a service
    pub fn resolve_endpoint(&self, service_name: &str) -> Result<ServiceEndpoint, NotFoundError> {
        self.registry.get_service_endpoint(service_name)
    }

    /// Resolve `service_name` and consult its breaker
    ///
    /// A `true` taken while the breaker is half-open consumes the single trial,
    /// so the caller must report the outcome.
    pub fn is_admitted(&self, service_name: &str) -> bool {
        match self.resolve_endpoint(service_name) {
            Ok(endpoint) => self.breakers.get_or_create(&endpoint).try_acquire().is_ok(),
            Err(_) => false,
        }
    }

    /// Run the whole pipeline
    pub fn admit(&self, request: &AdmissionRequest) -> GatewayResult<Admission> {
        let principal = self.authenticate(&request.credentials)?;

        if !self.authorize(&principal, &request.resource, &request.action) {
            info!(
                subject = %principal.subject_id,
                resource = %request.resource,
                action = %request.action,
                "Request denied: not authorized"
            );
            return Err(GatewayError::authz(&request.resource, &request.action));
        }

        let endpoint = self.resolve_endpoint(&request.service_name)?;

        if let Err(open) = self.breakers.get_or_create(&endpoint).try_acquire() {
            warn!(
                subject = %principal.subject_id,
                endpoint = %open.endpoint,
                "Request denied: circuit open"
            );
            return Err(open.into());
        }

        debug!(
            subject = %principal.subject_id,
            service = %endpoint.service_name,
            base_url = %endpoint.base_url,
            "Request admitted"
        );
        Ok(Admission { principal, endpoint })
    }

    /// Feed a downstream result to the endpoint's breaker
    ///
    /// Outcomes for endpoints that are no longer registered are dropped.
    /// Outcomes carry no admission identity, so while the breaker is half-open
    /// the first outcome reported decides the trial, even a late one from a
    /// request admitted before the circuit opened.
    pub fn record_outcome(&self, endpoint: &ServiceEndpoint, success: bool) {
        let registered = self
            .registry
            .get_service_endpoints(&endpoint.service_name)
            .into_iter()
            .find(|candidate| candidate.base_url == endpoint.base_url);

        let Some(current) = registered else {
            debug!(endpoint = %endpoint.key(), "Outcome for unknown endpoint ignored");
            return;
        };

        let breaker = self.breakers.get_or_create(&current);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    // API key management

    pub fn create_api_key(
        &self,
        name: &str,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecordWithSecret, ValidationError> {
        self.api_keys.create_api_key(name, permissions, expires_at)
    }

    pub fn revoke_api_key(&self, key: &str) -> Result<RevokeOutcome, NotFoundError> {
        self.api_keys.revoke_api_key(key)
    }

    pub fn list_api_keys(&self) -> Vec<ApiKeyRecord> {
        self.api_keys.list_api_keys()
    }

    pub fn get_api_key(&self, id: &str) -> Result<ApiKeyRecord, NotFoundError> {
        self.api_keys.get_api_key(id)
    }

    // Registry management

    /// Register or replace an endpoint; a replaced endpoint starts with a
    /// fresh breaker
    pub fn register_service(&self, endpoint: ServiceEndpoint) -> Result<(), ValidationError> {
        let key = endpoint.key();
        self.registry.register_service(endpoint)?;
        self.breakers.remove(&key);
        Ok(())
    }

    pub fn deregister_service(&self, service_name: &str, base_url: &str) -> Result<(), NotFoundError> {
        self.registry.deregister_service(service_name, base_url)?;
        self.breakers
            .remove(&endpoint_key(service_name, base_url));
        Ok(())
    }

    /// Replay the static service table; endpoints whose settings changed get
    /// a fresh breaker
    pub fn discover_services(&self) -> Vec<ServiceEndpoint> {
        let discovered = self.registry.discover_services();
        for endpoint in &discovered {
            if self.breakers.discard_if_stale(endpoint) {
                debug!(endpoint = %endpoint.key(), "Discarded breaker with outdated settings");
            }
        }
        discovered
    }

    pub fn get_all_services(&self) -> Vec<ServiceEndpoint> {
        self.registry.get_all_services()
    }

    pub fn get_service_endpoints(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.registry.get_service_endpoints(service_name)
    }

    pub fn set_service_health(
        &self,
        service_name: &str,
        base_url: &str,
        is_healthy: bool,
    ) -> Result<(), NotFoundError> {
        self.registry.set_health(service_name, base_url, is_healthy)
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Registry change feed (registrations, removals, health flips)
    pub fn subscribe_to_service_changes(&self) -> ServiceChangeReceiver {
        self.registry.subscribe_to_changes()
    }

    pub fn token_validator(&self) -> &TokenValidator {
        &self.tokens
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.config)
    }

    /// Header carrying API keys when no Authorization header is sent
    pub fn api_key_header(&self) -> &str {
        &self.config.auth.api_keys.header_name
    }

    /// Clear keys, registry entries and breakers
    pub fn reset(&self) {
        self.credential_store.reset();
        self.registry.reset();
        self.breakers.reset();
        warn!("Admission state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.jwt.secret = "unit-test-secret-for-admission".to_string();
        config.services = vec![ServiceEndpoint::new("users", "http://users:8080")];
        config
    }

    #[test]
    fn test_credentials_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("x-api-key", HeaderValue::from_static("gw_key"));

        let credentials = Credentials::from_headers(&headers, "x-api-key");
        assert_eq!(credentials.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(credentials.api_key.as_deref(), Some("gw_key"));

        let empty = Credentials::from_headers(&HeaderMap::new(), "x-api-key");
        assert_eq!(empty, Credentials::default());
    }

    #[test]
    fn test_construction_discovers_services() {
        let controller = GatewayAdmissionController::new(config()).unwrap();
        assert_eq!(controller.get_all_services().len(), 1);
        assert!(controller.list_api_keys().is_empty());
    }

    #[test]
    fn test_construction_rejects_empty_secret() {
        let mut config = config();
        config.auth.jwt.secret.clear();
        assert!(matches!(
            GatewayAdmissionController::new(config),
            Err(GatewayError::Configuration { .. })
        ));
    }

    #[test]
    fn test_no_credentials() {
        let controller = GatewayAdmissionController::new(config()).unwrap();
        assert_eq!(
            controller.authenticate(&Credentials::default()),
            Err(AuthError::CredentialsRequired)
        );
        let blank = Credentials {
            authorization: Some("  ".to_string()),
            api_key: Some(String::new()),
        };
        assert_eq!(controller.authenticate(&blank), Err(AuthError::CredentialsRequired));
    }

    #[tokio::test]
    async fn test_service_changes_are_published() {
        let controller = GatewayAdmissionController::new(config()).unwrap();
        let mut changes = controller.subscribe_to_service_changes();

        controller
            .register_service(ServiceEndpoint::new("audit", "http://audit:8080"))
            .unwrap();
        controller
            .deregister_service("audit", "http://audit:8080")
            .unwrap();

        assert!(matches!(
            changes.recv().await.unwrap(),
            crate::discovery::ServiceChangeEvent::Registered(ref e) if e.service_name == "audit"
        ));
        assert!(matches!(
            changes.recv().await.unwrap(),
            crate::discovery::ServiceChangeEvent::Deregistered { .. }
        ));
    }

    #[test]
    fn test_record_outcome_for_unknown_endpoint_is_ignored() {
        let controller = GatewayAdmissionController::new(config()).unwrap();
        controller.record_outcome(&ServiceEndpoint::new("ghost", "http://ghost:1"), false);
        assert!(controller.breaker_snapshots().is_empty());
    }
}
