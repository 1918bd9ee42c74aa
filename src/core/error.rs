//! # Error Handling
//!
//! Typed errors for the admission layer. Expected outcomes (missing credential,
//! expired token or key, unknown service, open circuit) are values the caller
//! branches on; only configuration problems abort startup.
//!
//! The leaf enums (`AuthError`, `ValidationError`, `NotFoundError`,
//! `CircuitOpenError`) are what the individual components return.
//! `GatewayError` wraps them for the HTTP edge and knows how to turn itself into
//! a status code and a JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Authentication failures produced by the token validator and the API key
/// authenticator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token was presented (or only the scheme was)
    #[error("Bearer token is required")]
    TokenRequired,

    /// No API key was presented
    #[error("API key is required")]
    KeyRequired,

    /// Neither an Authorization header nor an API key header was present
    #[error("Credentials are required")]
    CredentialsRequired,

    /// Token signature does not verify against the configured secret
    #[error("Token signature is invalid")]
    InvalidSignature,

    /// Token expiry is at or before the validation instant
    #[error("Token has expired")]
    TokenExpired,

    /// Token cannot be decoded at all
    #[error("Token is malformed: {0}")]
    MalformedToken(String),

    /// A claim required to build a principal is absent
    #[error("Token is missing required claim: {0}")]
    MissingClaim(&'static str),

    /// Issuer does not match configuration
    #[error("Token issuer is not accepted")]
    InvalidIssuer,

    /// Audience does not match configuration
    #[error("Token audience is not accepted")]
    InvalidAudience,

    /// No stored key hash matches the presented key
    #[error("API key not found")]
    KeyNotFound,

    /// The key exists but has been revoked
    #[error("API key is inactive")]
    KeyInactive,

    /// The key exists but its expiry has passed
    #[error("API key has expired")]
    KeyExpired,
}

impl AuthError {
    /// Machine-readable reason used in logs and error bodies
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TokenRequired => "token_required",
            Self::KeyRequired => "key_required",
            Self::CredentialsRequired => "credentials_required",
            Self::InvalidSignature => "invalid_signature",
            Self::TokenExpired => "token_expired",
            Self::MalformedToken(_) => "malformed_token",
            Self::MissingClaim(_) => "missing_claim",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::KeyNotFound => "key_not_found",
            Self::KeyInactive => "key_inactive",
            Self::KeyExpired => "key_expired",
        }
    }
}

/// Input validation failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Name is required")]
    NameRequired,

    #[error("Subject is required")]
    SubjectRequired,

    #[error("Resource is required")]
    ResourceRequired,

    #[error("Action is required")]
    ActionRequired,

    #[error("Service name is required")]
    ServiceNameRequired,

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Failure threshold must be within [0, 1], got {0}")]
    InvalidFailureThreshold(f64),
}

/// Lookup failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Service not found: {name}")]
    ServiceNotFound { name: String },

    #[error("API key not found")]
    ApiKeyNotFound,
}

impl NotFoundError {
    pub fn service<S: Into<String>>(name: S) -> Self {
        Self::ServiceNotFound { name: name.into() }
    }
}

/// Returned when a breaker refuses to let a request through
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Circuit breaker open for endpoint: {endpoint}")]
pub struct CircuitOpenError {
    pub endpoint: String,
}

/// Umbrella error for the HTTP edge and for startup
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Authentication failures
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The principal is not allowed to perform the action
    #[error("Authorization failed: {resource}:{action}")]
    Authorization { resource: String, action: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authorization error for a resource/action pair
    pub fn authz<R: Into<String>, A: Into<String>>(resource: R, action: A) -> Self {
        Self::Authorization {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authentication(_) => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::CircuitOpen(_) => "circuit_breaker_open",
            Self::Io { .. } => "io_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        if let Self::Authentication(reason) = &self {
            body["error"]["reason"] = json!(reason.reason());
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::from(AuthError::TokenExpired).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::authz("users", "delete").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::from(NotFoundError::service("billing")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(CircuitOpenError {
                endpoint: "billing@http://billing:8080".to_string()
            })
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(ValidationError::NameRequired).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_types() {
        assert_eq!(GatewayError::config("x").error_type(), "configuration_error");
        assert_eq!(
            GatewayError::from(AuthError::KeyInactive).error_type(),
            "authentication_error"
        );
        assert_eq!(AuthError::KeyInactive.reason(), "key_inactive");
    }

    #[test]
    fn test_messages_carry_context() {
        let err = GatewayError::from(NotFoundError::service("Billing"));
        assert_eq!(err.to_string(), "Service not found: Billing");

        let err = GatewayError::from(ValidationError::InvalidFailureThreshold(1.5));
        assert!(err.to_string().contains("1.5"));
    }
}
