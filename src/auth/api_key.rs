//! # API Key Authentication
//!
//! API keys are opaque prefixed strings (`gw_` + 32 alphanumerics by default).
//! Only the SHA-256 hash of a key is stored; the plaintext is handed back once,
//! at creation. Records are soft-revoked, never deleted, so audit trails that
//! reference a key id stay valid.
//!
//! The [`CredentialStore`] is a `DashMap` keyed by key hash. Usage counters and
//! the active flag are atomics on the shared record, so validations of the same
//! key never block each other and unrelated keys never contend.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::token::strip_scheme;
use crate::core::config::{ApiKeyConfig, BootstrapKeyConfig};
use crate::core::error::{AuthError, GatewayError, GatewayResult, NotFoundError, ValidationError};
use crate::core::types::{AuthMethod, Principal};

/// Role every API key principal carries
pub const API_CLIENT_ROLE: &str = "api-client";

const GENERATED_KEY_LENGTH: usize = 32;

/// Public view of an API key; carries no key material of any kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Result of key creation: the only time the plaintext key is visible
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecordWithSecret {
    #[serde(flatten)]
    pub record: ApiKeyRecord,

    /// Plaintext API key (only returned on creation)
    pub key: String,
}

/// What a revocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
}

/// Stored form of a key
#[derive(Debug)]
struct StoredApiKey {
    id: String,
    name: String,
    permissions: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    /// Insertion sequence, for stable listing order
    sequence: u64,
    is_active: AtomicBool,
    usage_count: AtomicU64,
    last_used_at: RwLock<Option<DateTime<Utc>>>,
}

impl StoredApiKey {
    fn to_record(&self) -> ApiKeyRecord {
        ApiKeyRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            permissions: self.permissions.clone(),
            is_active: self.is_active.load(Ordering::Acquire),
            created_at: self.created_at,
            expires_at: self.expires_at,
            usage_count: self.usage_count.load(Ordering::Acquire),
            last_used_at: *self.last_used_at.read(),
        }
    }
}

/// In-memory API key storage indexed by key hash
#[derive(Debug, Default)]
pub struct CredentialStore {
    by_hash: DashMap<String, Arc<StoredApiKey>>,
    /// Key id to key hash
    by_id: DashMap<String, String>,
    next_sequence: AtomicU64,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record under `key_hash`; `None` if the hash is taken
    fn insert(
        &self,
        key_hash: String,
        name: String,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Option<ApiKeyRecord> {
        match self.by_hash.entry(key_hash.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let stored = Arc::new(StoredApiKey {
                    id: Uuid::new_v4().to_string(),
                    name,
                    permissions,
                    created_at: Utc::now(),
                    expires_at,
                    sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                    is_active: AtomicBool::new(true),
                    usage_count: AtomicU64::new(0),
                    last_used_at: RwLock::new(None),
                });
                self.by_id.insert(stored.id.clone(), key_hash);
                let record = stored.to_record();
                slot.insert(stored);
                Some(record)
            }
        }
    }

    fn find_by_hash(&self, key_hash: &str) -> Option<Arc<StoredApiKey>> {
        self.by_hash.get(key_hash).map(|entry| Arc::clone(entry.value()))
    }

    /// Public record for a key id
    pub fn get(&self, id: &str) -> Option<ApiKeyRecord> {
        let hash = self.by_id.get(id)?.value().clone();
        self.find_by_hash(&hash).map(|stored| stored.to_record())
    }

    /// All records in creation order, without key material
    pub fn records(&self) -> Vec<ApiKeyRecord> {
        let mut stored: Vec<Arc<StoredApiKey>> = self
            .by_hash
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stored.sort_by_key(|s| s.sequence);
        stored.iter().map(|s| s.to_record()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Drop every record
    pub fn reset(&self) {
        self.by_hash.clear();
        self.by_id.clear();
    }
}

/// Validates, creates, revokes and lists API keys
pub struct ApiKeyAuthenticator {
    store: Arc<CredentialStore>,
    key_prefix: String,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<CredentialStore>, config: &ApiKeyConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
        }
    }

    /// SHA-256 of a key as lowercase hex
    pub fn hash_key(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Fresh key: prefix followed by 32 random alphanumerics
    pub fn generate_key(&self) -> String {
        let body: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_KEY_LENGTH)
            .map(char::from)
            .collect();
        format!("{}{}", self.key_prefix, body)
    }

    /// Whether a presented value looks like key material from this gateway
    pub fn is_key_material(&self, value: &str) -> bool {
        value.trim().starts_with(&self.key_prefix)
    }

    /// Validate a presented key now
    pub fn validate_api_key(&self, raw: &str) -> Result<Principal, AuthError> {
        self.validate_api_key_at(raw, Utc::now())
    }

    /// Validate a presented key against an explicit clock reading
    ///
    /// A successful validation bumps the usage counter and last-used time.
    pub fn validate_api_key_at(&self, raw: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let key = strip_api_key_scheme(raw);
        if key.is_empty() {
            return Err(AuthError::KeyRequired);
        }

        let stored = self
            .store
            .find_by_hash(&Self::hash_key(key))
            .ok_or(AuthError::KeyNotFound)?;

        if !stored.is_active.load(Ordering::Acquire) {
            debug!(key_id = %stored.id, "Rejected revoked API key");
            return Err(AuthError::KeyInactive);
        }

        if stored.expires_at.map_or(false, |exp| exp <= now) {
            debug!(key_id = %stored.id, "Rejected expired API key");
            return Err(AuthError::KeyExpired);
        }

        stored.usage_count.fetch_add(1, Ordering::AcqRel);
        {
            let mut last_used = stored.last_used_at.write();
            if last_used.map_or(true, |previous| previous < now) {
                *last_used = Some(now);
            }
        }

        let mut attributes = std::collections::HashMap::new();
        attributes.insert("api_key_name".to_string(), serde_json::json!(stored.name));

        Ok(Principal {
            subject_id: stored.id.clone(),
            email: None,
            roles: BTreeSet::from([API_CLIENT_ROLE.to_string()]),
            permissions: stored.permissions.iter().cloned().collect(),
            expires_at: stored.expires_at,
            auth_method: AuthMethod::ApiKey,
            attributes,
        })
    }

    /// Create a key; the returned plaintext is never retrievable again
    pub fn create_api_key(
        &self,
        name: &str,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecordWithSecret, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::NameRequired);
        }

        loop {
            let key = self.generate_key();
            if let Some(record) = self.store.insert(
                Self::hash_key(&key),
                name.to_string(),
                permissions.clone(),
                expires_at,
            ) {
                info!(key_id = %record.id, name = %record.name, "API key created");
                return Ok(ApiKeyRecordWithSecret { record, key });
            }
        }
    }

    /// Revoke the key matching `raw`; repeated calls are harmless
    pub fn revoke_api_key(&self, raw: &str) -> Result<RevokeOutcome, NotFoundError> {
        let key = strip_api_key_scheme(raw);
        let stored = self
            .store
            .find_by_hash(&Self::hash_key(key))
            .ok_or(NotFoundError::ApiKeyNotFound)?;

        if stored.is_active.swap(false, Ordering::AcqRel) {
            info!(key_id = %stored.id, "API key revoked");
            Ok(RevokeOutcome::Revoked)
        } else {
            debug!(key_id = %stored.id, "API key was already revoked");
            Ok(RevokeOutcome::AlreadyRevoked)
        }
    }

    /// Every key, active or not, with key material omitted
    pub fn list_api_keys(&self) -> Vec<ApiKeyRecord> {
        self.store.records()
    }

    pub fn get_api_key(&self, id: &str) -> Result<ApiKeyRecord, NotFoundError> {
        self.store.get(id).ok_or(NotFoundError::ApiKeyNotFound)
    }

    /// Install the configured bootstrap key, if enabled
    pub fn provision_bootstrap(&self, config: &BootstrapKeyConfig) -> GatewayResult<Option<ApiKeyRecord>> {
        if !config.enabled {
            return Ok(None);
        }

        let key = config
            .key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::config("Bootstrap API key is enabled but not configured"))?;

        match self.store.insert(
            Self::hash_key(key),
            config.name.clone(),
            config.permissions.clone(),
            None,
        ) {
            Some(record) => {
                warn!(key_id = %record.id, name = %record.name, "Bootstrap API key provisioned");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

/// Remove an optional case-insensitive `ApiKey ` scheme and surrounding whitespace
pub fn strip_api_key_scheme(raw: &str) -> &str {
    strip_scheme(raw, "apikey")
}
