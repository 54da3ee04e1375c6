use axum::{Router, routing::get};

pub mod invoices;
pub mod orders;
pub mod requests;
pub mod system;
pub mod webhooks;

/// Router for all endpoints that need a caller identity.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/orders", orders::router())
        .nest("/invoices", invoices::router())
        .nest("/requests", requests::router())
}
