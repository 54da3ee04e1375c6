//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse classification of a failure, used by transports to pick a status
/// code and by callers to decide whether a retry can help.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Authorization,
    ExternalGateway,
    InvalidTransition,
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Storage failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The actor lacks the privilege or ownership the operation needs.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The order (or line) cannot move from `from` to `to`.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Invoice creation found no shipped, un-invoiced orders in the selection.
    #[error("no eligible orders")]
    NoEligibleOrders,

    /// Monthly invoicing found nothing new to bill.
    #[error("nothing to invoice")]
    NothingToInvoice,

    /// The discount code cannot be applied.
    #[error("invalid discount: {0}")]
    InvalidDiscount(String),

    /// The payment would push the invoice past its payable amount.
    #[error("amount {amount} exceeds outstanding balance {balance}")]
    AmountExceedsBalance { amount: u64, balance: u64 },

    /// A pending request already exists for the same order or order line.
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),

    /// The payment gateway could not be reached or refused the call.
    #[error("payment gateway error: {0}")]
    ExternalGateway(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Debug, to: impl core::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn duplicate_request(msg: impl Into<String>) -> Self {
        Self::DuplicateRequest(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_)
            | DomainError::InvariantViolation(_)
            | DomainError::InvalidId(_)
            | DomainError::NoEligibleOrders
            | DomainError::NothingToInvoice
            | DomainError::InvalidDiscount(_)
            | DomainError::AmountExceedsBalance { .. } => ErrorKind::Validation,
            DomainError::NotFound => ErrorKind::NotFound,
            DomainError::Conflict(_) | DomainError::DuplicateRequest(_) => ErrorKind::Conflict,
            DomainError::Unauthorized(_) => ErrorKind::Authorization,
            DomainError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DomainError::ExternalGateway(_) => ErrorKind::ExternalGateway,
        }
    }
}
