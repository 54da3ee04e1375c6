//! `podledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the order, invoice
//! and request aggregates (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{AggregateId, LedgerEntryId, LineId, PaymentId, UserId, WebhookLogId};
