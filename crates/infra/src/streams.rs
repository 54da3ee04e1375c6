//! Aggregate type names used as stream identifiers in the event store.

pub const ORDER_STREAM: &str = "orders.order";
pub const INVOICE_STREAM: &str = "invoicing.invoice";
pub const REQUEST_STREAM: &str = "requests.request";
