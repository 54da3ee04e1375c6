//! Order ledger domain module (event-sourced).
//!
//! Orders, their lines (order details) and the production status state
//! machine, implemented purely as deterministic domain logic (no IO, no HTTP,
//! no storage).

pub mod order;
pub mod status;

pub use order::{
    AssignDesigner, CreateOrder, MarkInvoiced, NewLine, Order, OrderCommand, OrderEvent, OrderId,
    OrderLine, PlaceUnderReview, RecordRefund, RefundEntry, ReleaseFromInvoice, ReleaseHold,
    ReprintResolution, RequestReprint, ResolveReprint, ResolveReview, ReviewResolution,
    SetLineStatus, TransitionStatus,
};
pub use status::{LineStatus, OrderStatus, StatusSnapshot, TransitionTable, Workflow};
