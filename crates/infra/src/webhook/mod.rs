//! Inbound payment webhooks: durable log, signatures and payload parsing.
//!
//! Reconciliation against invoices lives in
//! [`services::reconciler`](crate::services::reconciler).

pub mod log;
pub mod parser;
pub mod postgres;
pub mod signature;

use thiserror::Error;

use podledger_core::WebhookLogId;

pub use log::{
    InMemoryWebhookLogStore, ProcessingState, WebhookLog, WebhookLogStore, WebhookSource,
};
pub use postgres::PostgresWebhookLogStore;
pub use parser::{ParsedWebhook, PaymentNotice, PaymentOutcome};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook log store failure: {0}")]
    Store(String),

    #[error("unknown webhook source '{0}'")]
    UnknownSource(String),

    #[error("webhook signature verification failed")]
    Signature,

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error("webhook log {0} not found")]
    NotFound(WebhookLogId),

    /// Infrastructure failure while applying the payment; the log was
    /// released for a later retry.
    #[error("webhook processing failed: {0}")]
    Processing(String),
}
