//! # Gateway Admission Library
//!
//! The admission-control layer of the API gateway. For every inbound request
//! it decides who is calling, whether they may proceed, and which downstream
//! endpoint should receive the call, while keeping failing endpoints isolated
//! behind per-endpoint circuit breakers.
//!
//! ## Pipeline
//!
//! ```text
//! credentials ──► TokenValidator / ApiKeyAuthenticator ──► Principal
//!                                                           │
//!                     PermissionEvaluator (resource:action) ◄┘
//!                                                           │
//!                     ServiceRegistry (service → endpoint)  ◄┘
//!                                                           │
//!                     CircuitBreaker (per endpoint)         ◄┘──► admit / deny
//! ```
//!
//! Proxying the request itself is out of scope; callers report the downstream
//! outcome back so the breaker can track it.
//!
//! ## Usage Example
//! ```rust,no_run
//! use gateway_admission::{AdmissionRequest, Credentials, GatewayAdmissionController, GatewayConfig};
//!
//! # fn run() -> gateway_admission::GatewayResult<()> {
//! let mut config = GatewayConfig::default();
//! config.auth.jwt.secret = "change-me".to_string();
//! let controller = GatewayAdmissionController::new(config)?;
//!
//! let request = AdmissionRequest {
//!     credentials: Credentials::api_key("gw_..."),
//!     service_name: "users".to_string(),
//!     resource: "users".to_string(),
//!     action: "read".to_string(),
//! };
//! let admission = controller.admit(&request)?;
//! // ... call admission.endpoint, then:
//! controller.record_outcome(&admission.endpoint, true);
//! # Ok(())
//! # }
//! ```

/// Error types, configuration, shared data structures and circuit breaking
pub mod core;

/// Token and API key authentication plus permission evaluation
pub mod auth;

/// Service registry with static discovery and dynamic registration
pub mod discovery;

/// The admission controller tying the pipeline together
pub mod gateway;

/// Admin HTTP API
pub mod admin;

/// Structured logging setup
pub mod observability;

// Re-export commonly used types for convenience
pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{
    AuthError, CircuitOpenError, GatewayError, GatewayResult, NotFoundError, ValidationError,
};
pub use crate::core::types::{AuthMethod, Principal, ServiceEndpoint};
pub use gateway::{Admission, AdmissionRequest, Credentials, GatewayAdmissionController};
