//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus
//! ```
//!
//! Multi-aggregate operations stage several commands into a [`UnitOfWork`]
//! and hand it to [`CommandDispatcher::commit`], which appends every stream
//! in one atomic batch before publishing.
//!
//! This module contains no IO itself; it composes infrastructure traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use podledger_auth::AuthzError;
use podledger_core::{Aggregate, AggregateId, DomainError, ErrorKind, ExpectedVersion};
use podledger_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Deterministic business failure from an aggregate or service check.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Optimistic concurrency failure (e.g. stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// Classification for callers; `None` for infrastructure failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DispatchError::Domain(e) => Some(e.kind()),
            DispatchError::Concurrency(_) => Some(ErrorKind::Conflict),
            DispatchError::Deserialize(_) | DispatchError::Store(_) | DispatchError::Publish(_) => {
                None
            }
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<AuthzError> for DispatchError {
    fn from(value: AuthzError) -> Self {
        DispatchError::Domain(value.into())
    }
}

/// An aggregate rebuilt from its stream, remembering the version it was
/// loaded at so a later append can be checked against it.
#[derive(Debug, Clone)]
pub struct Rehydrated<A> {
    pub aggregate_id: AggregateId,
    pub aggregate_type: &'static str,
    pub aggregate: A,
    pub loaded_version: u64,
}

impl<A> Rehydrated<A> {
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.loaded_version)
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - Events are persisted before publication (if append fails, nothing is published)
/// - Each append is checked against the version the aggregate was loaded at
/// - Publication failures after a successful append are returned as
///   `DispatchError::Publish`; the events are already durable
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate one aggregate.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Rehydrated<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, aggregate_type, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        Ok(Rehydrated {
            aggregate_id,
            aggregate_type,
            aggregate,
            loaded_version: stream_version(&history),
        })
    }

    /// Rehydrate every stream of `aggregate_type`.
    pub fn load_all<A>(
        &self,
        aggregate_type: &'static str,
        make_aggregate: impl Fn(AggregateId) -> A,
    ) -> Result<Vec<Rehydrated<A>>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        self.store
            .list_streams(aggregate_type)?
            .into_iter()
            .map(|id| self.load(id, aggregate_type, &make_aggregate))
            .collect()
    }

    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// Returns the committed events; an empty list means the aggregate
    /// decided there was nothing to do.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: podledger_events::Event + Serialize + DeserializeOwned,
    {
        self.execute(aggregate_id, aggregate_type, command, make_aggregate)
            .map(|(_, committed)| committed)
    }

    /// Like [`dispatch`](Self::dispatch), also returning the aggregate state
    /// after the new events were applied.
    pub fn execute<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<(A, Vec<StoredEvent>), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: podledger_events::Event + Serialize + DeserializeOwned,
    {
        let mut loaded = self.load(aggregate_id, aggregate_type, make_aggregate)?;
        let mut uow = UnitOfWork::new();
        uow.stage(&mut loaded, command)?;
        let committed = self.commit(uow)?;
        Ok((loaded.aggregate, committed))
    }

    /// Append every staged stream atomically, then publish.
    pub fn commit(&self, uow: UnitOfWork) -> Result<Vec<StoredEvent>, DispatchError> {
        let batch = uow.into_batch();
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let committed = self.store.append_batch(batch)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }
}

/// Wrap typed events for append.
pub(crate) fn to_uncommitted<E>(
    aggregate_id: AggregateId,
    aggregate_type: &str,
    events: &[E],
) -> Result<Vec<UncommittedEvent>, DispatchError>
where
    E: podledger_events::Event + Serialize,
{
    events
        .iter()
        .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
        .collect::<Result<Vec<_>, _>>()
        .map_err(DispatchError::from)
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    aggregate_type: &str,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Guard against a backend returning foreign or reordered events.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.aggregate_type != aggregate_type {
            return Err(DispatchError::Domain(DomainError::not_found()));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
