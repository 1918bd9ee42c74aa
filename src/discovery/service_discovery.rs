//! # Service Discovery Module
//!
//! In-memory registry of downstream endpoints. Entries come from the static
//! service table in configuration (discovery) and from explicit registration
//! through the admin API. Several endpoints may share a service name; the pair
//! (service name, base URL) identifies one entry.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for per-service locking, so lookups for one service never wait
//!   on writes to another
//! - `tokio::sync::broadcast` for change notifications to interested listeners

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::error::{NotFoundError, ValidationError};
use crate::core::types::ServiceEndpoint;

/// Service change event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceChangeEvent {
    /// A new endpoint was added
    Registered(ServiceEndpoint),
    /// An existing (name, base URL) entry was replaced
    Updated(ServiceEndpoint),
    Deregistered {
        service_name: String,
        base_url: String,
    },
    HealthChanged {
        service_name: String,
        base_url: String,
        is_healthy: bool,
    },
}

/// Type alias for service change event receiver
pub type ServiceChangeReceiver = broadcast::Receiver<ServiceChangeEvent>;

/// Type alias for service change event sender
pub type ServiceChangeSender = broadcast::Sender<ServiceChangeEvent>;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Thread-safe service registry using DashMap
pub struct ServiceRegistry {
    /// Endpoints indexed by service name, in registration order
    services: DashMap<String, Vec<ServiceEndpoint>>,
    /// Service table from configuration, replayed by `discover_services`
    static_services: Vec<ServiceEndpoint>,
    change_sender: ServiceChangeSender,
}

impl ServiceRegistry {
    /// Create an empty registry that discovers from `static_services`
    pub fn new(static_services: Vec<ServiceEndpoint>) -> Self {
        let (change_sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            services: DashMap::new(),
            static_services,
            change_sender,
        }
    }

    /// Upsert every configured service and return what was discovered
    ///
    /// Dynamically registered endpoints are left alone. Entries in the static
    /// table that fail validation are skipped; configuration validation
    /// rejects them before a registry is ever built.
    pub fn discover_services(&self) -> Vec<ServiceEndpoint> {
        let mut discovered = Vec::with_capacity(self.static_services.len());

        for endpoint in &self.static_services {
            match self.register_service(endpoint.clone()) {
                Ok(()) => discovered.push(endpoint.clone()),
                Err(e) => warn!(
                    service = %endpoint.service_name,
                    base_url = %endpoint.base_url,
                    error = %e,
                    "Skipping invalid static service"
                ),
            }
        }

        info!("Discovered {} services from configuration", discovered.len());
        discovered
    }

    /// First healthy endpoint for `service_name`, else the first registered one
    pub fn get_service_endpoint(&self, service_name: &str) -> Result<ServiceEndpoint, NotFoundError> {
        let endpoints = self
            .services
            .get(service_name)
            .ok_or_else(|| NotFoundError::service(service_name))?;

        let selected = endpoints
            .iter()
            .find(|endpoint| endpoint.is_healthy)
            .or_else(|| endpoints.first())
            .cloned();

        selected.ok_or_else(|| NotFoundError::service(service_name))
    }

    /// Every endpoint registered under `service_name`
    pub fn get_service_endpoints(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.services
            .get(service_name)
            .map(|endpoints| endpoints.clone())
            .unwrap_or_default()
    }

    /// Add an endpoint, or replace the entry with the same name and base URL
    pub fn register_service(&self, endpoint: ServiceEndpoint) -> Result<(), ValidationError> {
        endpoint.validate()?;

        debug!(
            service = %endpoint.service_name,
            base_url = %endpoint.base_url,
            "Registering service endpoint"
        );

        let event = {
            let mut endpoints = self
                .services
                .entry(endpoint.service_name.clone())
                .or_default();

            match endpoints
                .iter()
                .position(|existing| existing.base_url == endpoint.base_url)
            {
                Some(index) => {
                    endpoints[index] = endpoint.clone();
                    ServiceChangeEvent::Updated(endpoint)
                }
                None => {
                    endpoints.push(endpoint.clone());
                    ServiceChangeEvent::Registered(endpoint)
                }
            }
        };

        let _ = self.change_sender.send(event);
        Ok(())
    }

    /// Remove the entry matching both `service_name` and `base_url`
    pub fn deregister_service(&self, service_name: &str, base_url: &str) -> Result<(), NotFoundError> {
        {
            let mut endpoints = self
                .services
                .get_mut(service_name)
                .ok_or_else(|| NotFoundError::service(service_name))?;

            let before = endpoints.len();
            endpoints.retain(|endpoint| endpoint.base_url != base_url);
            if endpoints.len() == before {
                return Err(NotFoundError::service(service_name));
            }
        }

        // Re-checked under the shard lock so a concurrent registration survives
        self.services
            .remove_if(service_name, |_, endpoints| endpoints.is_empty());

        info!(service = %service_name, base_url = %base_url, "Deregistered service endpoint");
        let _ = self.change_sender.send(ServiceChangeEvent::Deregistered {
            service_name: service_name.to_string(),
            base_url: base_url.to_string(),
        });
        Ok(())
    }

    /// Snapshot ordered by service name, then registration order
    pub fn get_all_services(&self) -> Vec<ServiceEndpoint> {
        let mut grouped: Vec<(String, Vec<ServiceEndpoint>)> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        grouped.sort_by(|a, b| a.0.cmp(&b.0));

        grouped.into_iter().flat_map(|(_, endpoints)| endpoints).collect()
    }

    /// Mark one endpoint healthy or unhealthy
    pub fn set_health(
        &self,
        service_name: &str,
        base_url: &str,
        is_healthy: bool,
    ) -> Result<(), NotFoundError> {
        {
            let mut endpoints = self
                .services
                .get_mut(service_name)
                .ok_or_else(|| NotFoundError::service(service_name))?;

            let endpoint = endpoints
                .iter_mut()
                .find(|endpoint| endpoint.base_url == base_url)
                .ok_or_else(|| NotFoundError::service(service_name))?;

            if endpoint.is_healthy == is_healthy {
                return Ok(());
            }
            endpoint.is_healthy = is_healthy;
        }

        debug!(service = %service_name, base_url = %base_url, is_healthy, "Updated endpoint health");
        let _ = self.change_sender.send(ServiceChangeEvent::HealthChanged {
            service_name: service_name.to_string(),
            base_url: base_url.to_string(),
            is_healthy,
        });
        Ok(())
    }

    /// Get all service names, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe to service change events
    pub fn subscribe_to_changes(&self) -> ServiceChangeReceiver {
        self.change_sender.subscribe()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_services: self.services.len(),
            ..RegistryStats::default()
        };

        for entry in self.services.iter() {
            for endpoint in entry.value() {
                stats.total_endpoints += 1;
                if endpoint.is_healthy {
                    stats.healthy_endpoints += 1;
                } else {
                    stats.unhealthy_endpoints += 1;
                }
            }
        }

        stats
    }

    /// Drop every entry; the static table is kept for rediscovery
    pub fn reset(&self) {
        self.services.clear();
    }
}

/// Service registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub unhealthy_endpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(vec![
            ServiceEndpoint::new("identity", "http://identity:8080"),
            ServiceEndpoint::new("users", "http://users:8080"),
        ])
    }

    #[test]
    fn test_discover_from_static_table() {
        let registry = registry();
        assert!(registry.get_all_services().is_empty());

        let discovered = registry.discover_services();
        assert_eq!(discovered.len(), 2);
        assert_eq!(registry.service_names(), vec!["identity", "users"]);

        // Rediscovery upserts rather than duplicating
        registry.discover_services();
        assert_eq!(registry.get_all_services().len(), 2);
    }

    #[test]
    fn test_rediscovery_keeps_dynamic_entries() {
        let registry = registry();
        registry.discover_services();
        registry
            .register_service(ServiceEndpoint::new("audit", "http://audit:8080"))
            .unwrap();

        registry.discover_services();
        assert_eq!(registry.get_all_services().len(), 3);
    }

    #[test]
    fn test_register_is_visible_and_healthy() {
        let registry = registry();
        registry
            .register_service(ServiceEndpoint::new("Billing", "https://host:9/"))
            .unwrap();

        let all = registry.get_all_services();
        let billing = all
            .iter()
            .find(|e| e.service_name == "Billing" && e.base_url == "https://host:9/")
            .unwrap();
        assert!(billing.is_healthy);
    }

    #[test]
    fn test_register_replaces_same_pair_in_place() {
        let registry = ServiceRegistry::new(Vec::new());
        registry
            .register_service(ServiceEndpoint::new("users", "http://a:1"))
            .unwrap();
        registry
            .register_service(ServiceEndpoint::new("users", "http://b:1"))
            .unwrap();
        registry
            .register_service(ServiceEndpoint::new("users", "http://a:1").with_failure_threshold(0.9))
            .unwrap();

        let endpoints = registry.get_service_endpoints("users");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].base_url, "http://a:1");
        assert_eq!(endpoints[0].failure_threshold, 0.9);
    }

    #[test]
    fn test_registration_validation() {
        let registry = ServiceRegistry::new(Vec::new());

        assert_eq!(
            registry.register_service(ServiceEndpoint::new(" ", "http://a:1")),
            Err(ValidationError::ServiceNameRequired)
        );
        assert!(matches!(
            registry.register_service(ServiceEndpoint::new("a", "not a url")),
            Err(ValidationError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            registry.register_service(ServiceEndpoint::new("a", "ftp://files:21")),
            Err(ValidationError::InvalidBaseUrl { .. })
        ));
        assert_eq!(
            registry.register_service(ServiceEndpoint::new("a", "http://a:1").with_failure_threshold(1.5)),
            Err(ValidationError::InvalidFailureThreshold(1.5))
        );
        assert!(registry.get_all_services().is_empty());
    }

    #[test]
    fn test_endpoint_selection_prefers_healthy() {
        let registry = ServiceRegistry::new(Vec::new());
        registry
            .register_service(ServiceEndpoint::new("users", "http://a:1"))
            .unwrap();
        registry
            .register_service(ServiceEndpoint::new("users", "http://b:1"))
            .unwrap();

        assert_eq!(registry.get_service_endpoint("users").unwrap().base_url, "http://a:1");

        registry.set_health("users", "http://a:1", false).unwrap();
        assert_eq!(registry.get_service_endpoint("users").unwrap().base_url, "http://b:1");

        // With nothing healthy the first entry is still returned
        registry.set_health("users", "http://b:1", false).unwrap();
        assert_eq!(registry.get_service_endpoint("users").unwrap().base_url, "http://a:1");
    }

    #[test]
    fn test_deregister_then_lookup() {
        let registry = registry();
        registry.discover_services();

        registry.deregister_service("users", "http://users:8080").unwrap();
        assert_eq!(
            registry.get_service_endpoint("users"),
            Err(NotFoundError::service("users"))
        );
        assert_eq!(registry.service_names(), vec!["identity"]);
    }

    #[test]
    fn test_deregister_matches_base_url() {
        let registry = ServiceRegistry::new(Vec::new());
        registry
            .register_service(ServiceEndpoint::new("users", "http://a:1"))
            .unwrap();
        registry
            .register_service(ServiceEndpoint::new("users", "http://b:1"))
            .unwrap();

        assert!(registry.deregister_service("users", "http://c:1").is_err());
        registry.deregister_service("users", "http://a:1").unwrap();
        assert_eq!(registry.get_service_endpoint("users").unwrap().base_url, "http://b:1");
        assert!(registry.deregister_service("nothing", "http://a:1").is_err());
    }

    #[test]
    fn test_all_services_ordering() {
        let registry = ServiceRegistry::new(Vec::new());
        for (name, url) in [("users", "http://u2:1"), ("audit", "http://a:1"), ("users", "http://u1:1")] {
            registry.register_service(ServiceEndpoint::new(name, url)).unwrap();
        }

        let order: Vec<(String, String)> = registry
            .get_all_services()
            .into_iter()
            .map(|e| (e.service_name, e.base_url))
            .collect();
        assert_eq!(
            order,
            vec![
                ("audit".to_string(), "http://a:1".to_string()),
                ("users".to_string(), "http://u2:1".to_string()),
                ("users".to_string(), "http://u1:1".to_string()),
            ]
        );
    }

    #[test]
    fn test_stats_and_reset() {
        let registry = registry();
        registry.discover_services();
        registry.set_health("identity", "http://identity:8080", false).unwrap();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                total_services: 2,
                total_endpoints: 2,
                healthy_endpoints: 1,
                unhealthy_endpoints: 1,
            }
        );

        registry.reset();
        assert_eq!(registry.stats(), RegistryStats::default());
        assert_eq!(registry.discover_services().len(), 2);
    }

    #[tokio::test]
    async fn test_change_events() {
        let registry = ServiceRegistry::new(Vec::new());
        let mut changes = registry.subscribe_to_changes();

        let endpoint = ServiceEndpoint::new("users", "http://a:1");
        registry.register_service(endpoint.clone()).unwrap();
        registry.set_health("users", "http://a:1", false).unwrap();
        registry.deregister_service("users", "http://a:1").unwrap();

        assert_eq!(changes.recv().await.unwrap(), ServiceChangeEvent::Registered(endpoint));
        assert!(matches!(
            changes.recv().await.unwrap(),
            ServiceChangeEvent::HealthChanged { is_healthy: false, .. }
        ));
        assert!(matches!(
            changes.recv().await.unwrap(),
            ServiceChangeEvent::Deregistered { .. }
        ));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = ServiceRegistry::new(Vec::new());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..50 {
                        let url = format!("http://w{}-{}:80", worker, i);
                        registry
                            .register_service(ServiceEndpoint::new("users", url))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(registry.get_service_endpoints("users").len(), 400);
    }
}
