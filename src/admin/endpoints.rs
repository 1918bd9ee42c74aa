//! # Admin Endpoints
//!
//! HTTP surface over the admission controller: API key lifecycle, the service
//! registry, breaker inspection, and an admission check that runs the full
//! pipeline for the caller's own credentials.
//!
//! ## Security Note
//! Every route except `GET /health` and `POST /admission/check` requires a
//! principal authorized for `gateway:admin`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::api_key::{ApiKeyRecord, RevokeOutcome};
use crate::core::circuit_breaker::CircuitBreakerSnapshot;
use crate::core::error::{GatewayError, GatewayResult, NotFoundError};
use crate::core::types::{Principal, ServiceEndpoint};
use crate::discovery::RegistryStats;
use crate::gateway::{AdmissionRequest, Credentials, GatewayAdmissionController};

/// Resource and action guarding the admin routes
const ADMIN_RESOURCE: &str = "gateway";
const ADMIN_ACTION: &str = "admin";

/// Routes reachable without the admin grant
const PUBLIC_PATHS: &[&str] = &["/health", "/admission/check"];

/// Admin router state
#[derive(Clone)]
pub struct AdminState {
    pub controller: Arc<GatewayAdmissionController>,
}

impl AdminState {
    pub fn new(controller: Arc<GatewayAdmissionController>) -> Self {
        Self { controller }
    }
}

/// Admin router for key, registry and breaker management
pub struct AdminRouter;

impl AdminRouter {
    /// Create the admin router with all endpoints
    pub fn create_router(state: AdminState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            // API key management
            .route("/admin/api-keys", get(list_api_keys).post(create_api_key))
            .route("/admin/api-keys/revoke", post(revoke_api_key))
            // Service registry
            .route(
                "/admin/services",
                get(list_services)
                    .post(register_service)
                    .delete(deregister_service),
            )
            .route("/admin/services/discover", post(discover_services))
            .route("/admin/services/:name", get(get_service))
            // Circuit breakers
            .route("/admin/circuit-breakers", get(list_circuit_breakers))
            // Admission pipeline
            .route("/admission/check", post(check_admission))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn_with_state(
                        state.clone(),
                        admin_auth_middleware,
                    )),
            )
            .with_state(state)
    }

    /// Bind and serve until the shutdown future resolves
    pub async fn serve<F>(state: AdminState, address: SocketAddr, shutdown: F) -> GatewayResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to bind admin server: {}", e)))?;

        info!(address = %address, "Admin server listening");

        axum::serve(listener, Self::create_router(state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))
    }
}

// ============================================================================
// Middleware Functions
// ============================================================================

/// Admin authentication middleware
async fn admin_auth_middleware(
    State(state): State<AdminState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let controller = &state.controller;
    let credentials = Credentials::from_headers(request.headers(), controller.api_key_header());
    let principal = controller.authenticate(&credentials)?;

    if !controller.authorize(&principal, ADMIN_RESOURCE, ADMIN_ACTION) {
        return Err(GatewayError::authz(ADMIN_RESOURCE, ADMIN_ACTION));
    }

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

// ============================================================================
// Request and Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeApiKeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeApiKeyResponse {
    pub outcome: RevokeOutcome,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyListResponse {
    pub api_keys: Vec<ApiKeyRecord>,
    pub total_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ServiceListResponse {
    pub services: Vec<ServiceEndpoint>,
    pub stats: RegistryStats,
}

#[derive(Debug, Deserialize)]
pub struct DeregisterParams {
    pub service_name: String,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub total_count: usize,
}

/// Body of `POST /admission/check`; credentials come from the headers
#[derive(Debug, Deserialize)]
pub struct AdmissionCheckRequest {
    pub service_name: String,
    pub resource: String,
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct AdmissionCheckResponse {
    pub admitted: bool,
    pub principal: Principal,
    pub endpoint: ServiceEndpoint,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "registry": state.controller.registry_stats(),
        "api_keys": state.controller.list_api_keys().len(),
    }))
}

async fn list_api_keys(State(state): State<AdminState>) -> Json<ApiKeyListResponse> {
    let api_keys = state.controller.list_api_keys();
    Json(ApiKeyListResponse {
        total_count: api_keys.len(),
        api_keys,
    })
}

async fn create_api_key(
    State(state): State<AdminState>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let created = state
        .controller
        .create_api_key(&body.name, body.permissions, body.expires_at)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn revoke_api_key(
    State(state): State<AdminState>,
    Json(body): Json<RevokeApiKeyRequest>,
) -> Result<Json<RevokeApiKeyResponse>, GatewayError> {
    let outcome = state.controller.revoke_api_key(&body.key)?;
    Ok(Json(RevokeApiKeyResponse { outcome }))
}

async fn list_services(State(state): State<AdminState>) -> Json<ServiceListResponse> {
    Json(ServiceListResponse {
        services: state.controller.get_all_services(),
        stats: state.controller.registry_stats(),
    })
}

async fn get_service(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ServiceEndpoint>>, GatewayError> {
    let endpoints = state.controller.get_service_endpoints(&name);
    if endpoints.is_empty() {
        return Err(NotFoundError::service(name).into());
    }
    Ok(Json(endpoints))
}

async fn register_service(
    State(state): State<AdminState>,
    Json(endpoint): Json<ServiceEndpoint>,
) -> Result<impl IntoResponse, GatewayError> {
    state.controller.register_service(endpoint.clone())?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

async fn deregister_service(
    State(state): State<AdminState>,
    Query(params): Query<DeregisterParams>,
) -> Result<StatusCode, GatewayError> {
    state
        .controller
        .deregister_service(&params.service_name, &params.base_url)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn discover_services(State(state): State<AdminState>) -> impl IntoResponse {
    let discovered = state.controller.discover_services();
    Json(json!({
        "discovered": discovered,
        "total_count": discovered.len(),
    }))
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> Json<CircuitBreakerListResponse> {
    let circuit_breakers = state.controller.breaker_snapshots();
    Json(CircuitBreakerListResponse {
        total_count: circuit_breakers.len(),
        circuit_breakers,
    })
}

async fn check_admission(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(body): Json<AdmissionCheckRequest>,
) -> Result<Json<AdmissionCheckResponse>, GatewayError> {
    let request = AdmissionRequest {
        credentials: Credentials::from_headers(&headers, state.controller.api_key_header()),
        service_name: body.service_name,
        resource: body.resource,
        action: body.action,
    };

    let admission = state.controller.admit(&request)?;
    Ok(Json(AdmissionCheckResponse {
        admitted: true,
        principal: admission.principal,
        endpoint: admission.endpoint,
    }))
}
