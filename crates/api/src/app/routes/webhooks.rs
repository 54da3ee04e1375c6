//! Payment gateway callbacks.
//!
//! The raw body is logged before anything else; the response tells the
//! gateway whether to retry (5xx) or stop.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use podledger_infra::services::ProcessOutcome;

use crate::app::errors;
use crate::app::services::AppServices;

pub const SIGNATURE_HEADER: &str = "x-signature";

pub fn router() -> Router {
    Router::new().route("/:source", post(receive_webhook))
}

pub async fn receive_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match services.reconciler.handle(&source, &body, signature) {
        Ok((log_id, outcome)) => {
            let (status, detail) = describe(&outcome);
            Json(serde_json::json!({
                "log_id": log_id.to_string(),
                "outcome": status,
                "detail": detail,
            }))
            .into_response()
        }
        Err(e) => errors::webhook_error_to_response(e),
    }
}

fn describe(outcome: &ProcessOutcome) -> (&'static str, Option<&str>) {
    match outcome {
        ProcessOutcome::Processed => ("processed", None),
        ProcessOutcome::Duplicate => ("duplicate", None),
        ProcessOutcome::Ignored(reason) => ("ignored", Some(reason.as_str())),
        ProcessOutcome::Rejected(reason) => ("rejected", Some(reason.as_str())),
        ProcessOutcome::AlreadyHandled => ("already_handled", None),
    }
}
