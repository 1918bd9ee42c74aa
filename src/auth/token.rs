//! # Bearer Token Validation
//!
//! HS256-signed JWTs verified against the shared secret from configuration.
//! Validation is a pure function of the token string and the clock: no I/O, no
//! retries, zero clock skew.
//!
//! Expiry is read from the claims before the signature is checked, so an
//! expired token reports `TokenExpired` whatever its signature. Everything else
//! (issuer, audience, claim shape) is only trusted after verification.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::JwtConfig;
use crate::core::error::{AuthError, GatewayError, GatewayResult};
use crate::core::types::{AuthMethod, Principal};

/// Claims consumed or emitted by the gateway
///
/// Anything not listed here lands in `extra` and is carried on the principal
/// as an opaque attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Name-identifier claim, used when `sub` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub role: OneOrMany,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub roles: OneOrMany,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub permissions: OneOrMany,

    /// Space-separated OAuth-style scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A claim that may be a single string or an array of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::One(_) => false,
            Self::Many(values) => values.is_empty(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &String> {
        let slice: &[String] = match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        };
        slice.iter()
    }
}

/// Registered claims that are validated rather than passed through
const REGISTERED_CLAIMS: &[&str] = &["iss", "aud", "iat", "nbf", "jti"];

/// Verifies bearer tokens and maps their claims to a [`Principal`]
pub struct TokenValidator {
    config: JwtConfig,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl TokenValidator {
    /// Build a validator; an empty secret is a startup error
    pub fn new(config: JwtConfig) -> GatewayResult<Self> {
        if config.secret.trim().is_empty() {
            return Err(GatewayError::config("JWT signing secret is not configured"));
        }

        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());

        Ok(Self {
            config,
            decoding_key,
            encoding_key,
        })
    }

    /// Validate a raw token (with or without the `Bearer ` scheme) now
    pub fn validate_token(&self, raw: &str) -> Result<Principal, AuthError> {
        self.validate_token_at(raw, Utc::now())
    }

    /// Validate a raw token against an explicit clock reading
    pub fn validate_token_at(&self, raw: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let token = strip_bearer(raw);
        if token.is_empty() {
            return Err(AuthError::TokenRequired);
        }

        let unverified = self.peek_claims(token)?;
        let exp = unverified.exp.ok_or(AuthError::MissingClaim("exp"))?;
        if exp <= now.timestamp() {
            return Err(AuthError::TokenExpired);
        }

        let claims = self.verify(token)?;
        let principal = to_principal(claims)?;

        debug!(subject = %principal.subject_id, "Bearer token validated");
        Ok(principal)
    }

    /// Sign a token for `subject` with the configured issuer and audience
    pub fn issue_token(
        &self,
        subject: &str,
        email: Option<&str>,
        roles: &[&str],
        permissions: &[&str],
        ttl: Option<Duration>,
    ) -> GatewayResult<String> {
        let now = Utc::now().timestamp();
        let ttl = ttl.unwrap_or(self.config.token_ttl);
        let exp = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| now.checked_add(secs))
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "Token TTL of {} is out of range",
                    humantime::format_duration(ttl)
                ))
            })?;

        let mut extra = HashMap::new();
        extra.insert("iat".to_string(), serde_json::json!(now));
        if let Some(issuer) = &self.config.issuer {
            extra.insert("iss".to_string(), serde_json::json!(issuer));
        }
        if let Some(audience) = &self.config.audience {
            extra.insert("aud".to_string(), serde_json::json!(audience));
        }

        let claims = TokenClaims {
            sub: Some(subject.to_string()),
            exp: Some(exp),
            email: email.map(str::to_string),
            roles: OneOrMany::Many(roles.iter().map(|r| r.to_string()).collect()),
            permissions: OneOrMany::Many(permissions.iter().map(|p| p.to_string()).collect()),
            extra,
            ..TokenClaims::default()
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::internal(format!("Failed to sign token: {}", e)))
    }

    /// Decode claims without checking the signature
    fn peek_claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))
    }

    /// Verify signature, issuer and audience
    fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        // Expiry was already checked against the caller's clock
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
            validation.required_spec_claims.insert("iss".to_string());
        }
        match &self.config.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                validation.required_spec_claims.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
                ErrorKind::InvalidAudience => AuthError::InvalidAudience,
                ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => AuthError::InvalidIssuer,
                ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => {
                    AuthError::InvalidAudience
                }
                _ => AuthError::MalformedToken(e.to_string()),
            })
    }
}

/// Remove a case-insensitive `Bearer ` scheme and surrounding whitespace
pub fn strip_bearer(raw: &str) -> &str {
    strip_scheme(raw, "bearer")
}

/// Whether `raw` starts with `scheme` (case-insensitive) as its first word
pub(crate) fn has_scheme(raw: &str, scheme: &str) -> bool {
    let trimmed = raw.trim();
    let head = trimmed.split_whitespace().next().unwrap_or_default();
    head.eq_ignore_ascii_case(scheme)
}

/// Strip `scheme` (case-insensitive) when it is the first word of `raw`
pub(crate) fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> &'a str {
    let trimmed = raw.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) if head.eq_ignore_ascii_case(scheme) => rest.trim(),
        None if trimmed.eq_ignore_ascii_case(scheme) => "",
        _ => trimmed,
    }
}

fn to_principal(claims: TokenClaims) -> Result<Principal, AuthError> {
    let subject_id = claims
        .sub
        .or(claims.nameid)
        .filter(|s| !s.trim().is_empty())
        .ok_or(AuthError::MissingClaim("sub"))?;

    let roles: BTreeSet<String> = claims.role.iter().chain(claims.roles.iter()).cloned().collect();

    let mut permissions: BTreeSet<String> = claims.permissions.iter().cloned().collect();
    if let Some(scope) = &claims.scope {
        permissions.extend(scope.split_whitespace().map(str::to_string));
    }

    let expires_at = claims
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single());

    let attributes = claims
        .extra
        .into_iter()
        .filter(|(name, _)| !REGISTERED_CLAIMS.contains(&name.as_str()))
        .collect();

    Ok(Principal {
        subject_id,
        email: claims.email,
        roles,
        permissions,
        expires_at,
        auth_method: AuthMethod::Token,
        attributes,
    })
}
