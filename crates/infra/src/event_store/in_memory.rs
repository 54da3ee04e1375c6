use std::collections::HashMap;
use std::sync::RwLock;

use podledger_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

#[derive(Debug, Default)]
struct Streams {
    by_id: HashMap<AggregateId, Vec<StoredEvent>>,
    /// Stream ids in creation order.
    order: Vec<AggregateId>,
}

/// In-memory append-only event store.
///
/// Intended for tests and the dev server. A single write lock covers a whole
/// batch, which is what makes `append_batch` atomic.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<Streams>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Check that a batch for one stream is internally consistent and can be
    /// appended at the stream's current version. Writes nothing.
    fn validate(streams: &Streams, append: &StreamAppend) -> Result<(), EventStoreError> {
        let Some(first) = append.events.first() else {
            return Ok(());
        };
        let aggregate_type = &first.aggregate_type;

        for (idx, e) in append.events.iter().enumerate() {
            if e.aggregate_id != append.aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if &e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let stream = streams
            .by_id
            .get(&append.aggregate_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let current = Self::current_version(stream);

        if !append.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {}: expected {:?}, found {current}",
                append.aggregate_id, append.expected_version
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if &existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        Ok(())
    }

    fn write(streams: &mut Streams, append: StreamAppend) -> Vec<StoredEvent> {
        if append.events.is_empty() {
            return vec![];
        }

        if !streams.by_id.contains_key(&append.aggregate_id) {
            streams.order.push(append.aggregate_id);
        }
        let stream = streams.by_id.entry(append.aggregate_id).or_default();
        let mut next = Self::current_version(stream) + 1;

        let mut committed = Vec::with_capacity(append.events.len());
        for e in append.events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }
        committed
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let aggregate_id = first.aggregate_id;

        self.append_batch(vec![StreamAppend {
            aggregate_id,
            expected_version,
            events,
        }])
    }

    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        for (idx, append) in batch.iter().enumerate() {
            if batch[..idx]
                .iter()
                .any(|other| other.aggregate_id == append.aggregate_id)
            {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream {} appears twice in one batch",
                    append.aggregate_id
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        // Phase 1: every check passes before anything is written.
        for append in &batch {
            Self::validate(&streams, append)?;
        }

        // Phase 2: commit all streams.
        let mut committed = Vec::new();
        for append in batch {
            committed.extend(Self::write(&mut streams, append));
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(streams.by_id.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(streams
            .order
            .iter()
            .filter(|id| {
                streams
                    .by_id
                    .get(id)
                    .and_then(|s| s.first())
                    .is_some_and(|e| e.aggregate_type == aggregate_type)
            })
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.event".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_assigns_sequence_numbers_from_one() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let committed = store
            .append(
                vec![event(id, "orders.order"), event(id, "orders.order")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(
            committed.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let err = store
            .append(vec![event(id, "orders.order")], ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let order = AggregateId::new();
        let invoice = AggregateId::new();
        store
            .append(vec![event(order, "orders.order")], ExpectedVersion::Exact(0))
            .unwrap();

        // The order stream is at 1, so the stale expectation fails the batch.
        let err = store
            .append_batch(vec![
                StreamAppend {
                    aggregate_id: invoice,
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(invoice, "invoicing.invoice")],
                },
                StreamAppend {
                    aggregate_id: order,
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(order, "orders.order")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(store.load_stream(invoice).unwrap().is_empty());
        assert_eq!(store.load_stream(order).unwrap().len(), 1);
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![event(id, "orders.order")], ExpectedVersion::Any)
            .unwrap();

        let err = store
            .append(vec![event(id, "invoicing.invoice")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn list_streams_filters_by_type_in_creation_order() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let c = AggregateId::new();
        for (id, ty) in [(a, "orders.order"), (b, "invoicing.invoice"), (c, "orders.order")] {
            store.append(vec![event(id, ty)], ExpectedVersion::Exact(0)).unwrap();
        }

        assert_eq!(store.list_streams("orders.order").unwrap(), vec![a, c]);
        assert_eq!(store.list_streams("invoicing.invoice").unwrap(), vec![b]);
    }
}
