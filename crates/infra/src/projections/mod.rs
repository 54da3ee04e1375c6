//! Read models built from committed events.
//!
//! Projections are rebuildable from the event store and idempotent under
//! redelivery.

pub mod invoice_lookup;

pub use invoice_lookup::{InvoiceLookup, InvoiceLookupError};
