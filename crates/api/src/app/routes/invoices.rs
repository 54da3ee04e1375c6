use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use podledger_core::{AggregateId, UserId};
use podledger_infra::services::{AdHocInvoice, ManualPayment, OrderSelection};
use podledger_invoicing::{InvoiceId, PaymentMethod};
use podledger_orders::OrderId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_invoices))
        .route("/ad-hoc", post(create_ad_hoc_invoice))
        .route("/monthly", post(create_monthly_invoice))
        .route("/:id", get(get_invoice))
        .route("/:id/payments", post(record_payment))
        .route("/:id/payment-link", post(create_payment_link))
        .route("/:id/cancel", post(cancel_invoice))
}

fn invoice_id(raw: &str) -> Result<InvoiceId, axum::response::Response> {
    errors::parse_id::<AggregateId>(raw, "invoice id").map(InvoiceId::new)
}

fn selection(body: &dto::AdHocInvoiceRequest) -> Result<OrderSelection, axum::response::Response> {
    if let Some(ids) = &body.order_ids {
        let mut order_ids = Vec::with_capacity(ids.len());
        for raw in ids {
            order_ids.push(OrderId::new(errors::parse_id::<AggregateId>(raw, "order id")?));
        }
        return Ok(OrderSelection::OrderIds(order_ids));
    }

    match (body.from, body.to) {
        (Some(from), Some(to)) => Ok(OrderSelection::DateRange { from, to }),
        _ => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "provide order_ids or both from and to",
        )),
    }
}

pub async fn create_ad_hoc_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::AdHocInvoiceRequest>,
) -> axum::response::Response {
    let seller_id = match errors::parse_id::<UserId>(&body.seller_id, "seller_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let selection = match selection(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let invoice = match services.invoices.create_ad_hoc_invoice(
        principal.principal(),
        AdHocInvoice {
            seller_id,
            selection,
            notes: body.notes,
            discount_code: body.discount_code,
        },
    ) {
        Ok(i) => i,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (StatusCode::CREATED, Json(dto::invoice_to_json(&invoice))).into_response()
}

pub async fn create_monthly_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::MonthlyInvoiceRequest>,
) -> axum::response::Response {
    let seller_id = match errors::parse_id::<UserId>(&body.seller_id, "seller_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.invoices.create_monthly_invoice(
        principal.principal(),
        seller_id,
        body.year,
        body.month,
    ) {
        Ok(invoice) => (StatusCode::CREATED, Json(dto::invoice_to_json(&invoice))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::SellerQuery>,
) -> axum::response::Response {
    let seller_id = match errors::parse_id::<UserId>(&query.seller_id, "seller_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.invoices.list_invoices(principal.principal(), seller_id) {
        Ok(invoices) => {
            Json(invoices.iter().map(dto::invoice_to_json).collect::<Vec<_>>()).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.invoices.get_invoice(principal.principal(), invoice_id) {
        Ok(invoice) => Json(dto::invoice_to_json(&invoice)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn record_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::RecordPaymentRequest>,
) -> axum::response::Response {
    let invoice_id = match invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outcome = match services.payments.record_payment(
        principal.principal(),
        invoice_id,
        ManualPayment {
            amount: body.amount,
            method: body.method.unwrap_or(PaymentMethod::Manual),
            gateway_reference: body.gateway_reference,
        },
    ) {
        Ok(o) => o,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    let mut json = dto::invoice_to_json(&outcome.invoice);
    json["applied"] = serde_json::Value::Bool(outcome.applied);
    Json(json).into_response()
}

pub async fn create_payment_link(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::PaymentLinkRequest>,
) -> axum::response::Response {
    let invoice_id = match invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .payments
        .create_payment_link(principal.principal(), invoice_id, body.amount)
    {
        Ok(link) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "checkout_url": link.checkout_url,
                "reference": link.reference,
            })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn cancel_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::CancelInvoiceRequest>,
) -> axum::response::Response {
    let invoice_id = match invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .invoices
        .cancel_invoice(principal.principal(), invoice_id, body.reason)
    {
        Ok(invoice) => Json(dto::invoice_to_json(&invoice)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
