use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::{AggregateId, PaymentId};
use podledger_orders::OrderId;

/// Charges raise `amount_paid`; refunds are negative payments that lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Charge,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Manual,
    BankTransfer,
    PaymentLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// A single money movement against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: PaymentId,
    /// Always positive; direction comes from `kind`.
    pub amount: u64,
    pub kind: PaymentKind,
    pub method: PaymentMethod,
    pub gateway_reference: Option<String>,
    pub status: PaymentStatus,
    /// Order a refund was posted for.
    pub order_id: Option<OrderId>,
    /// Review request that produced a refund.
    pub request_id: Option<AggregateId>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_completed(&self) -> bool {
        self.status == PaymentStatus::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    pub fn has_reference(&self, reference: &str) -> bool {
        self.gateway_reference.as_deref() == Some(reference)
    }
}

/// Net of completed charges minus completed refunds.
///
/// Always equals the invoice's `amount_paid`; kept as a free function so
/// callers can audit a payment list independently of the aggregate.
pub fn completed_net(payments: &[Payment]) -> u64 {
    let (charges, refunds) = payments
        .iter()
        .filter(|p| p.is_completed())
        .fold((0u64, 0u64), |(c, r), p| match p.kind {
            PaymentKind::Charge => (c.saturating_add(p.amount), r),
            PaymentKind::Refund => (c, r.saturating_add(p.amount)),
        });
    charges.saturating_sub(refunds)
}
