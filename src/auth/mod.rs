//! # Authentication and Authorization
//!
//! - [`token`]: HS256 bearer token validation and issuance
//! - [`api_key`]: hashed API key storage, validation and lifecycle
//! - [`permissions`]: recognised operations and grant evaluation

pub mod api_key;
pub mod permissions;
pub mod token;

pub use api_key::{
    ApiKeyAuthenticator, ApiKeyRecord, ApiKeyRecordWithSecret, CredentialStore, RevokeOutcome,
};
pub use permissions::PermissionEvaluator;
pub use token::{TokenClaims, TokenValidator};
