//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: event store, bus, collaborators and application services
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use podledger_infra::config::AppConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: &AppConfig) -> anyhow::Result<Router> {
    let services = services::build_services(config).await?;
    Ok(build_app_with(Arc::new(services)))
}

/// Build the router around already-wired services.
pub fn build_app_with(services: Arc<AppServices>) -> Router {
    // Protected routes: require caller identity.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn(middleware::identity_middleware));

    // Gateways authenticate with payload signatures instead.
    let webhooks = routes::webhooks::router().layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", webhooks)
        .merge(protected)
        .layer(ServiceBuilder::new())
}
