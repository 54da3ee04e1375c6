use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use podledger_core::{AggregateId, LineId};
use podledger_infra::services::{NewRefund, NewReprint};
use podledger_orders::OrderId;
use podledger_requests::{Decision, RequestId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_requests))
        .route("/refund", post(submit_refund))
        .route("/cancellation", post(submit_cancellation))
        .route("/reprint", post(submit_reprint))
        .route("/:id", get(get_request))
        .route("/:id/review", post(review_request))
}

fn order_id(raw: &str) -> Result<OrderId, axum::response::Response> {
    errors::parse_id::<AggregateId>(raw, "order_id").map(OrderId::new)
}

fn request_id(raw: &str) -> Result<RequestId, axum::response::Response> {
    errors::parse_id::<AggregateId>(raw, "request id").map(RequestId::new)
}

fn created(request: &podledger_requests::ReviewRequest) -> axum::response::Response {
    (StatusCode::CREATED, Json(dto::request_to_json(request))).into_response()
}

pub async fn submit_refund(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::RefundRequestBody>,
) -> axum::response::Response {
    let order_id = match order_id(&body.order_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.workflows.submit_refund(
        principal.principal(),
        NewRefund {
            order_id,
            amount: body.amount,
            reason: body.reason,
            proof: body.proof,
        },
    ) {
        Ok(request) => created(&request),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn submit_cancellation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CancellationRequestBody>,
) -> axum::response::Response {
    let order_id = match order_id(&body.order_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.workflows.submit_cancellation(
        principal.principal(),
        order_id,
        body.reason,
        body.proof,
    ) {
        Ok(request) => created(&request),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn submit_reprint(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::ReprintRequestBody>,
) -> axum::response::Response {
    let order_id = match order_id(&body.order_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let line_id = match errors::parse_id::<LineId>(&body.line_id, "line_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.workflows.submit_reprint(
        principal.principal(),
        NewReprint {
            order_id,
            line_id,
            reason: body.reason,
            proof: body.proof,
        },
    ) {
        Ok(request) => created(&request),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Body is the decision itself: `{"decision":"approved"}` or
/// `{"decision":"rejected","reason":"..."}`.
pub async fn review_request(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(decision): Json<Decision>,
) -> axum::response::Response {
    let request_id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .workflows
        .review(principal.principal(), request_id, decision)
    {
        Ok(request) => Json(dto::request_to_json(&request)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_request(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let request_id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.workflows.get_request(principal.principal(), request_id) {
        Ok(request) => Json(dto::request_to_json(&request)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_requests(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::OrderQuery>,
) -> axum::response::Response {
    let order_id = match order_id(&query.order_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.workflows.list_requests(principal.principal(), order_id) {
        Ok(requests) => {
            Json(requests.iter().map(dto::request_to_json).collect::<Vec<_>>()).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
