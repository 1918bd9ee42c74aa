//! # Configuration Module
//!
//! Configuration for the admission layer: signing key, API key handling,
//! permission table, static downstream services, breaker sampling and logging.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable override support (`GATEWAY_*`)
//! - Validation with every problem reported at once

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceEndpoint;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Admin listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Token and API key settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Recognised resource/action table and role grants
    #[serde(default)]
    pub permissions: PermissionConfig,

    /// Static downstream service table
    #[serde(default)]
    pub services: Vec<ServiceEndpoint>,

    /// Breaker sampling shared by every endpoint
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML without overrides or validation
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Secrets are expected to come from the environment in deployed setups,
    /// e.g. `GATEWAY_JWT_SECRET` and `GATEWAY_BOOTSTRAP_API_KEY`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt.secret = secret;
        }

        if let Ok(issuer) = env::var("GATEWAY_JWT_ISSUER") {
            self.auth.jwt.issuer = Some(issuer);
        }

        if let Ok(audience) = env::var("GATEWAY_JWT_AUDIENCE") {
            self.auth.jwt.audience = Some(audience);
        }

        if let Ok(key) = env::var("GATEWAY_BOOTSTRAP_API_KEY") {
            self.auth.api_keys.bootstrap.key = Some(key);
        }

        if let Ok(addr) = env::var("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(port) = env::var("GATEWAY_ADMIN_PORT") {
            self.server.admin_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_ADMIN_PORT: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration, reporting every problem found
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }

        if self.auth.jwt.secret.trim().is_empty() {
            errors.push("auth.jwt.secret cannot be empty".to_string());
        }

        if self.auth.api_keys.header_name.trim().is_empty() {
            errors.push("auth.api_keys.header_name cannot be empty".to_string());
        }

        if self.auth.api_keys.key_prefix.is_empty() {
            errors.push("auth.api_keys.key_prefix cannot be empty".to_string());
        }

        let bootstrap = &self.auth.api_keys.bootstrap;
        if bootstrap.enabled {
            match bootstrap.key.as_deref().map(str::trim) {
                None | Some("") => errors.push(
                    "auth.api_keys.bootstrap is enabled but no key is configured".to_string(),
                ),
                Some(_) => {}
            }
            if bootstrap.name.trim().is_empty() {
                errors.push("auth.api_keys.bootstrap.name cannot be empty".to_string());
            }
        }

        for (resource, actions) in &self.permissions.resources {
            if resource.trim().is_empty() {
                errors.push("permissions.resources has an empty resource name".to_string());
            }
            if actions.iter().any(|a| a.trim().is_empty()) {
                errors.push(format!("Resource '{}' has an empty action", resource));
            }
        }

        for (index, service) in self.services.iter().enumerate() {
            if let Err(e) = service.validate() {
                errors.push(format!(
                    "Service {} ('{}' at '{}'): {}",
                    index, service.service_name, service.base_url, e
                ));
            }
        }

        for (i, a) in self.services.iter().enumerate() {
            if self.services[..i]
                .iter()
                .any(|b| b.service_name == a.service_name && b.base_url == a.base_url)
            {
                errors.push(format!(
                    "Service '{}' at '{}' is configured more than once",
                    a.service_name, a.base_url
                ));
            }
        }

        if self.circuit_breaker.sampling_window == 0 {
            errors.push("circuit_breaker.sampling_window must be greater than 0".to_string());
        }

        if self.circuit_breaker.minimum_throughput > self.circuit_breaker.sampling_window {
            errors.push(
                "circuit_breaker.minimum_throughput cannot exceed sampling_window".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Admin listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// Port serving the admin and admission-check API
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            admin_port: 9000,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: JwtConfig,

    #[serde(default)]
    pub api_keys: ApiKeyConfig,
}

/// Bearer token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Shared HMAC secret
    #[serde(default)]
    pub secret: String,

    /// Required `iss` claim, when set
    #[serde(default)]
    pub issuer: Option<String>,

    /// Required `aud` claim, when set
    #[serde(default)]
    pub audience: Option<String>,

    /// Lifetime of tokens issued by the gateway itself
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            audience: None,
            token_ttl: default_token_ttl(),
        }
    }
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Header carrying an API key when no Authorization header is sent
    pub header_name: String,

    /// Prefix on generated keys; also marks key material in `Bearer` values
    pub key_prefix: String,

    pub bootstrap: BootstrapKeyConfig,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            header_name: "x-api-key".to_string(),
            key_prefix: "gw_".to_string(),
            bootstrap: BootstrapKeyConfig::default(),
        }
    }
}

/// Operationally provisioned administrative key, off unless enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapKeyConfig {
    pub enabled: bool,

    pub name: String,

    /// Plaintext key; usually supplied through `GATEWAY_BOOTSTRAP_API_KEY`
    pub key: Option<String>,

    pub permissions: Vec<String>,
}

impl Default for BootstrapKeyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "bootstrap-admin".to_string(),
            key: None,
            permissions: vec!["gateway:admin".to_string(), "gateway:read".to_string()],
        }
    }
}

/// Resource/action table and role grants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Resource name to the actions recognised on it
    pub resources: BTreeMap<String, Vec<String>>,

    /// Role name to the permissions it implies
    pub role_grants: BTreeMap<String, Vec<String>>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        let table = |pairs: &[(&str, &[&str])]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect::<BTreeMap<String, Vec<String>>>()
        };

        Self {
            resources: table(&[
                ("identity", &["read", "write"]),
                ("users", &["read", "write", "delete"]),
                ("notifications", &["send", "read"]),
                ("audit", &["read"]),
                ("health", &["read"]),
                ("gateway", &["read", "admin"]),
            ]),
            role_grants: table(&[("admin", &["*"])]),
        }
    }
}

/// Circuit breaker sampling shared by all endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Number of most recent outcomes the failure ratio is computed over
    pub sampling_window: usize,

    /// Outcomes required in the window before the ratio is acted on
    pub minimum_throughput: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            sampling_window: 10,
            minimum_throughput: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
