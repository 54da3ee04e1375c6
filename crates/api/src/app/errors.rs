use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use podledger_core::{DomainError, ErrorKind};
use podledger_infra::command_dispatcher::DispatchError;
use podledger_infra::webhook::WebhookError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Domain(e) => domain_error_to_response(e),
        DispatchError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Deserialize(_) | DispatchError::Store(_) | DispatchError::Publish(_) => {
            tracing::error!(error = %err, "request failed in infrastructure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let code = match &err {
        DomainError::Validation(_) => "validation_error",
        DomainError::InvariantViolation(_) => "invariant_violation",
        DomainError::InvalidId(_) => "invalid_id",
        DomainError::NotFound => "not_found",
        DomainError::Conflict(_) => "conflict",
        DomainError::Unauthorized(_) => "forbidden",
        DomainError::InvalidTransition { .. } => "invalid_transition",
        DomainError::NoEligibleOrders => "no_eligible_orders",
        DomainError::NothingToInvoice => "nothing_to_invoice",
        DomainError::InvalidDiscount(_) => "invalid_discount",
        DomainError::AmountExceedsBalance { .. } => "amount_exceeds_balance",
        DomainError::DuplicateRequest(_) => "duplicate_request",
        DomainError::ExternalGateway(_) => "external_gateway",
    };

    let status = match &err {
        DomainError::InvariantViolation(_) | DomainError::AmountExceedsBalance { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::ExternalGateway => StatusCode::BAD_GATEWAY,
        },
    };

    json_error(status, code, err.to_string())
}

/// Gateways retry on 5xx only; everything else is final. A payload we
/// could not parse is answered with a 5xx so the gateway redelivers it,
/// while its log stays `Failed` for staff to inspect.
pub fn webhook_error_to_response(err: WebhookError) -> axum::response::Response {
    match err {
        WebhookError::Signature => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_signature", "invalid signature")
        }
        WebhookError::Malformed(msg) => {
            tracing::warn!(error = %msg, "rejecting malformed webhook for redelivery");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "malformed_payload", msg)
        }
        WebhookError::UnknownSource(source) => json_error(
            StatusCode::NOT_FOUND,
            "unknown_source",
            format!("unknown webhook source '{source}'"),
        ),
        WebhookError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        WebhookError::Store(_) | WebhookError::Processing(_) => {
            tracing::error!(error = %err, "webhook processing failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "retry_later",
                "webhook could not be processed",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse an id from a path or body field, answering 400 on failure.
pub fn parse_id<T: FromStr>(raw: &str, field: &str) -> Result<T, axum::response::Response> {
    raw.trim().parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {field}"),
        )
    })
}
