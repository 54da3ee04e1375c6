//! Append-only event store boundary.
//!
//! Defines the storage abstraction for aggregate event streams, including the
//! atomic multi-stream append used by the unit of work.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
