//! Invoicing domain module (event-sourced).
//!
//! Invoices aggregate shipped orders, apply discounts and track payments.
//! Everything here is deterministic domain logic; selection of eligible
//! orders and atomic commits live in the infra layer.

pub mod discount;
pub mod invoice;
pub mod payment;

pub use discount::{DiscountCode, DiscountKind};
pub use invoice::{
    AppliedDiscount, CancelInvoice, CompletePayment, FailPayment, InitiatePayment, Invoice,
    InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceItem, InvoiceStatus, IssueInvoice,
    RecordPayment, RecordRefund, RefundCredit, invoice_number,
};
pub use payment::{Payment, PaymentKind, PaymentMethod, PaymentStatus, completed_net};
