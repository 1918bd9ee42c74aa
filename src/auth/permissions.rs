//! # Permission Evaluation
//!
//! Two questions are answered here: is `resource:action` an operation the
//! gateway recognises at all, and does a given principal hold a grant for it.
//! Both are case-insensitive. Grants come from the principal's own permissions
//! and from the role grant table in configuration.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::core::config::PermissionConfig;
use crate::core::error::ValidationError;
use crate::core::types::Principal;

/// Grant matching any operation
pub const WILDCARD: &str = "*";

/// Case-folded view of the permission table
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    /// Resource to recognised actions
    resources: HashMap<String, HashSet<String>>,
    /// Role to implied permissions
    role_grants: HashMap<String, HashSet<String>>,
}

impl PermissionEvaluator {
    pub fn new(config: &PermissionConfig) -> Self {
        let fold = |table: &BTreeMap<String, Vec<String>>| -> HashMap<String, HashSet<String>> {
            table
                .iter()
                .map(|(key, values)| {
                    (
                        key.trim().to_lowercase(),
                        values.iter().map(|v| v.trim().to_lowercase()).collect(),
                    )
                })
                .collect()
        };

        Self {
            resources: fold(&config.resources),
            role_grants: fold(&config.role_grants),
        }
    }

    /// Whether `resource:action` is a recognised operation
    ///
    /// Unknown resources and actions are `Ok(false)`; only blank inputs are
    /// errors.
    pub fn check_permission(
        &self,
        subject_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, ValidationError> {
        if subject_id.trim().is_empty() {
            return Err(ValidationError::SubjectRequired);
        }
        if resource.trim().is_empty() {
            return Err(ValidationError::ResourceRequired);
        }
        if action.trim().is_empty() {
            return Err(ValidationError::ActionRequired);
        }

        Ok(self.is_recognised(resource, action))
    }

    fn is_recognised(&self, resource: &str, action: &str) -> bool {
        self.resources
            .get(&resource.trim().to_lowercase())
            .map_or(false, |actions| actions.contains(&action.trim().to_lowercase()))
    }

    /// Whether `principal` may perform `action` on `resource`
    pub fn authorize(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        match self.check_permission(&principal.subject_id, resource, action) {
            Ok(true) => {}
            Ok(false) => {
                debug!(resource, action, "Operation is not recognised");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "Authorization input rejected");
                return false;
            }
        }

        let resource = resource.trim().to_lowercase();
        let action = action.trim().to_lowercase();

        let direct = principal.permissions.iter().map(|p| p.trim().to_lowercase());
        let via_roles = principal
            .roles
            .iter()
            .filter_map(|role| self.role_grants.get(&role.trim().to_lowercase()))
            .flatten()
            .cloned();

        let granted = direct
            .chain(via_roles)
            .any(|grant| grant_matches(&grant, &resource, &action));

        if !granted {
            debug!(
                subject = %principal.subject_id,
                resource = %resource,
                action = %action,
                "Principal lacks a matching grant"
            );
        }
        granted
    }
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new(&PermissionConfig::default())
    }
}

/// `grant` is already lower-cased
fn grant_matches(grant: &str, resource: &str, action: &str) -> bool {
    if grant == WILDCARD || grant == action {
        return true;
    }

    match grant.split_once(':') {
        Some((granted_resource, granted_action)) => {
            granted_resource == resource && (granted_action == action || granted_action == WILDCARD)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_matching() {
        assert!(grant_matches("*", "users", "delete"));
        assert!(grant_matches("users:*", "users", "delete"));
        assert!(grant_matches("users:delete", "users", "delete"));
        assert!(grant_matches("delete", "users", "delete"));
        assert!(!grant_matches("users:read", "users", "delete"));
        assert!(!grant_matches("audit:*", "users", "delete"));
        assert!(!grant_matches("read", "users", "delete"));
    }
}
