use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use podledger_invoicing::{Invoice, PaymentMethod};
use podledger_orders::{Order, OrderStatus};
use podledger_requests::ReviewRequest;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct OrderLineRequest {
    pub variant_sku: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Defaults to the caller.
    pub seller_id: Option<String>,
    pub code: String,
    #[serde(default)]
    pub customer_ref: String,
    pub lines: Vec<OrderLineRequest>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct SellerQuery {
    pub seller_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AdHocInvoiceRequest {
    pub seller_id: String,
    /// Either explicit orders or a `[from, to)` shipped-at range.
    pub order_ids: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub discount_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MonthlyInvoiceRequest {
    pub seller_id: String,
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount: u64,
    pub method: Option<PaymentMethod>,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentLinkRequest {
    /// Defaults to the outstanding balance.
    pub amount: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelInvoiceRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequestBody {
    pub order_id: String,
    pub amount: u64,
    pub reason: String,
    pub proof: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancellationRequestBody {
    pub order_id: String,
    pub reason: String,
    pub proof: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReprintRequestBody {
    pub order_id: String,
    pub line_id: String,
    pub reason: String,
    pub proof: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    pub order_id: String,
}

// -------------------------
// Response mapping
// -------------------------

pub fn order_to_json(order: &Order) -> serde_json::Value {
    json!({
        "id": order.id_typed(),
        "code": order.code(),
        "seller_id": order.seller_id(),
        "customer_ref": order.customer_ref(),
        "status": order.status(),
        "under_review": order.is_under_review(),
        "lines": order.lines(),
        "total_cost": order.total_cost(),
        "refunded_amount": order.refunded_amount(),
        "refunds": order.refunds(),
        "invoice_id": order.invoice_id(),
        "shipped_at": order.shipped_at(),
        "created_at": order.created_at(),
        "updated_at": order.updated_at(),
    })
}

pub fn invoice_to_json(invoice: &Invoice) -> serde_json::Value {
    json!({
        "id": invoice.id_typed(),
        "number": invoice.number(),
        "seller_id": invoice.seller_id(),
        "status": invoice.status(),
        "items": invoice.items(),
        "total_amount": invoice.total_amount(),
        "discount_code": invoice.discount_code(),
        "discount_amount": invoice.discount_amount(),
        "credited_amount": invoice.credited_amount(),
        "credits": invoice.credits(),
        "payable_amount": invoice.payable_amount(),
        "amount_paid": invoice.amount_paid(),
        "outstanding_amount": invoice.outstanding_amount(),
        "payments": invoice.payments(),
        "notes": invoice.notes(),
        "issued_at": invoice.issued_at(),
        "due_date": invoice.due_date(),
        "cancel_reason": invoice.cancel_reason(),
    })
}

pub fn request_to_json(request: &ReviewRequest) -> serde_json::Value {
    json!({
        "id": request.id_typed(),
        "kind": request.kind(),
        "order_id": request.order_id(),
        "details": request.details(),
        "reason": request.reason(),
        "proof": request.proof(),
        "requester": request.requester(),
        "status": request.status(),
        "reviewer": request.reviewer(),
        "rejection_reason": request.rejection_reason(),
        "submitted_at": request.submitted_at(),
        "reviewed_at": request.reviewed_at(),
    })
}
