use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use podledger_core::{AggregateId, ExpectedVersion};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle: domain event from `handle()` → `UncommittedEvent` (serialized,
/// with stream metadata) → `StoredEvent` (sequence number assigned) →
/// `EventEnvelope` published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are per stream, start at 1, and never have gaps. The last
/// one is the stream version used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> podledger_events::EventEnvelope<JsonValue> {
        podledger_events::EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// Events for one stream inside an atomic multi-stream append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub aggregate_id: AggregateId,
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Event store operation error.
///
/// These are infrastructure errors (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only event store.
///
/// One stream per aggregate instance, keyed by `AggregateId`. Within a stream
/// events have sequence numbers 1, 2, 3, ...
///
/// Implementations must:
/// - enforce optimistic concurrency against the current stream version
/// - keep the aggregate type of a stream stable
/// - persist a batch atomically (all events or none), including
///   `append_batch` across several streams
pub trait EventStore: Send + Sync {
    /// Append events to a single aggregate stream.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append to several streams as one unit: every expected version is
    /// checked before anything is written, and either all streams advance or
    /// none do.
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an aggregate (empty if it does not exist).
    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Ids of every stream of the given aggregate type, in creation order.
    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_batch(batch)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        (**self).list_streams(aggregate_type)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: podledger_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
