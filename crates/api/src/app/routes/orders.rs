use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use podledger_auth::{Permission, authorize};
use podledger_core::{AggregateId, LineId, UserId};
use podledger_orders::{NewLine, OrderId};
use podledger_infra::services::NewOrder;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/transition", post(transition_order))
        .route("/:id/release-hold", post(release_hold))
        .route("/:id/sync-shipment", post(sync_shipment))
}

fn order_id(raw: &str) -> Result<OrderId, axum::response::Response> {
    errors::parse_id::<AggregateId>(raw, "order id").map(OrderId::new)
}

pub async fn create_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateOrderRequest>,
) -> axum::response::Response {
    let seller_id = match body.seller_id.as_deref() {
        Some(raw) => match errors::parse_id::<UserId>(raw, "seller_id") {
            Ok(v) => v,
            Err(resp) => return resp,
        },
        None => principal.user_id(),
    };

    let lines = body
        .lines
        .into_iter()
        .map(|l| NewLine {
            line_id: LineId::new(),
            variant_sku: l.variant_sku,
            product_name: l.product_name,
            quantity: l.quantity,
            unit_price: l.unit_price,
        })
        .collect();

    let order = match services.orders.create_order(
        principal.principal(),
        NewOrder {
            seller_id,
            code: body.code,
            customer_ref: body.customer_ref,
            lines,
        },
    ) {
        Ok(o) => o,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (StatusCode::CREATED, Json(dto::order_to_json(&order))).into_response()
}

pub async fn list_orders(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::SellerQuery>,
) -> axum::response::Response {
    let seller_id = match errors::parse_id::<UserId>(&query.seller_id, "seller_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.orders.list_orders(principal.principal(), seller_id) {
        Ok(orders) => Json(orders.iter().map(dto::order_to_json).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.orders.get_order(principal.principal(), order_id) {
        Ok(order) => Json(dto::order_to_json(&order)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn transition_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::TransitionRequest>,
) -> axum::response::Response {
    let order_id = match order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .orders
        .transition(principal.principal(), order_id, body.status)
    {
        Ok(order) => Json(dto::order_to_json(&order)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn release_hold(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.orders.release_hold(principal.principal(), order_id) {
        Ok(order) => Json(dto::order_to_json(&order)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Ask the shipment tracker whether a confirmed order has left the warehouse.
pub async fn sync_shipment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = authorize(principal.principal(), &Permission::ORDERS_TRANSITION) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    match services.orders.sync_shipment(order_id) {
        Ok(order) => Json(dto::order_to_json(&order)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
