use chrono::{DateTime, Utc};

/// A domain event.
///
/// Events are immutable facts, versioned for schema evolution, and only ever
/// appended to a stream.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "orders.order.status_changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
