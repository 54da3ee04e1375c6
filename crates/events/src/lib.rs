//! `podledger-events`: event contract, stream envelope and pub/sub bus.
//!
//! Orders, invoices and review requests are event-sourced: every accepted
//! command becomes one or more immutable events appended to the aggregate's
//! stream, then fanned out to subscribers (audit log, notifications).

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
