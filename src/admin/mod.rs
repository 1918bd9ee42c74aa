//! # Admin Module
//!
//! Administrative HTTP endpoints for the admission layer. It includes
//! functionality for:
//! - Creating, listing and revoking API keys
//! - Registering, deregistering and rediscovering downstream services
//! - Inspecting circuit breaker state and counters
//! - Running an admission check for the caller's credentials
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use gateway_admission::admin::{AdminRouter, AdminState};
//! use gateway_admission::core::config::GatewayConfig;
//! use gateway_admission::gateway::GatewayAdmissionController;
//!
//! let mut config = GatewayConfig::default();
//! config.auth.jwt.secret = "change-me".to_string();
//!
//! let controller = Arc::new(GatewayAdmissionController::new(config).unwrap());
//! let router = AdminRouter::create_router(AdminState::new(controller));
//! ```

pub mod endpoints;

pub use endpoints::{AdminRouter, AdminState};
