//! Refund, cancellation and reprint review requests (event-sourced).
//!
//! A request only records who asked for what and how staff decided. The
//! matching order mutations are committed alongside it by the workflow
//! services in the infra layer.

pub mod request;

pub use request::{
    Decision, RecordDecision, RequestCommand, RequestDetails, RequestEvent, RequestId, RequestKind,
    RequestStatus, ReviewRequest, SubmitRequest,
};
