//! Postgres-backed event store.
//!
//! One `events` table holds every stream. Optimistic concurrency is checked
//! inside the appending transaction and backed by the unique constraint on
//! `(aggregate_id, sequence_number)`: a writer that loses the race between
//! check and insert gets a unique violation, reported as `Concurrency`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | EventStoreError |
//! |------------|-----------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (check violation) | `23514` | `InvalidAppend` |
//! | Database (other) | any | `Unavailable` |
//! | PoolClosed / Io / timeouts | N/A | `Unavailable` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use podledger_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
use crate::postgres::{block_on, is_unique_violation, sqlstate};

/// Postgres-backed append-only event store.
///
/// `append_batch` runs in one transaction: every stream's version is checked
/// before the first insert, and all streams commit or none do.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresEventStore {
    /// Wrap a pool; queries run on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load_stream_async(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter()
            .map(|row| {
                StoredEventRow::from_row(row)
                    .map(StoredEvent::from)
                    .map_err(|e| {
                        EventStoreError::Unavailable(format!("failed to decode event row: {e}"))
                    })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    pub async fn list_streams_async(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id
            FROM events
            WHERE aggregate_type = $1 AND sequence_number = 1
            ORDER BY global_position ASC
            "#,
        )
        .bind(aggregate_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_streams", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("aggregate_id")
                    .map(AggregateId::from_uuid)
                    .map_err(|e| map_sqlx_error("list_streams", e))
            })
            .collect()
    }

    #[instrument(skip(self, batch), fields(streams = batch.len()), err)]
    pub async fn append_batch_async(
        &self,
        batch: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&batch)?;
        if batch.iter().all(|append| append.events.is_empty()) {
            return Ok(vec![]);
        }

        // Dropping `tx` on an early return rolls the whole batch back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut next_sequences = Vec::with_capacity(batch.len());
        for append in &batch {
            let Some(first) = append.events.first() else {
                next_sequences.push(0);
                continue;
            };
            let (current, existing_type) = check_stream_version(&mut tx, append.aggregate_id).await?;

            if let Some(existing) = existing_type {
                if existing != first.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{existing}', attempted append with '{}'",
                        first.aggregate_type
                    )));
                }
            }
            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    append.aggregate_id, append.expected_version
                )));
            }
            next_sequences.push(current + 1);
        }

        let mut committed = Vec::new();
        for (append, mut next) in batch.into_iter().zip(next_sequences) {
            for event in append.events {
                insert_event(&mut tx, &event, next).await?;
                committed.push(stored(event, next));
                next += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }

    fn run<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, EventStoreError>>,
    ) -> Result<T, EventStoreError> {
        block_on(&self.runtime, fut, EventStoreError::Unavailable)
    }
}

impl EventStore for PostgresEventStore {
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
        self.run(self.append_batch_async(batch))
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.run(self.load_stream_async(aggregate_id))
    }

    fn list_streams(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        self.run(self.list_streams_async(aggregate_type))
    }
}

/// Checks that need no database: one entry per stream, and each entry
/// carries a single aggregate id and type.
fn validate_batch(batch: &[StreamAppend]) -> Result<(), EventStoreError> {
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

        let Some(first) = append.events.first() else {
            continue;
        };
        for (i, e) in append.events.iter().enumerate() {
            if e.aggregate_id != append.aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {i})"
                )));
            }
            if e.aggregate_type != first.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {i})"
                )));
            }
        }
    }
    Ok(())
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version,
               MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(*aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    Ok((u64::try_from(current).unwrap_or(0), aggregate_type))
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &UncommittedEvent,
    sequence_number: u64,
) -> Result<(), EventStoreError> {
    let sequence = i64::try_from(sequence_number)
        .map_err(|_| EventStoreError::InvalidAppend("sequence number overflow".to_string()))?;
    let version = i32::try_from(event.event_version)
        .map_err(|_| EventStoreError::InvalidAppend("event version overflow".to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO events (
            event_id, aggregate_id, aggregate_type, sequence_number,
            event_type, event_version, occurred_at, payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.event_id)
    .bind(*event.aggregate_id.as_uuid())
    .bind(&event.aggregate_type)
    .bind(sequence)
    .bind(&event.event_type)
    .bind(version)
    .bind(event.occurred_at)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EventStoreError::Concurrency(format!(
                "concurrent append detected: stream {} already has sequence {sequence_number}",
                event.aggregate_id
            ))
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;
    Ok(())
}

fn stored(event: UncommittedEvent, sequence_number: u64) -> StoredEvent {
    StoredEvent {
        event_id: event.event_id,
        aggregate_id: event.aggregate_id,
        aggregate_type: event.aggregate_type,
        sequence_number,
        event_type: event.event_type,
        event_version: event.event_version,
        occurred_at: event.occurred_at,
        payload: event.payload,
    }
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match sqlstate(&err).as_deref() {
        Some("23505") => EventStoreError::Concurrency(format!("{operation}: {err}")),
        Some("23514") => EventStoreError::InvalidAppend(format!("{operation}: {err}")),
        _ => EventStoreError::Unavailable(format!("{operation}: {err}")),
    }
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for StoredEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: u64::try_from(row.sequence_number).unwrap_or(0),
            event_type: row.event_type,
            event_version: u32::try_from(row.event_version).unwrap_or(0),
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({ "n": 1 }),
        }
    }

    #[test]
    fn batches_are_validated_before_touching_the_database() {
        let a = AggregateId::new();
        let b = AggregateId::new();

        let twice = vec![
            StreamAppend {
                aggregate_id: a,
                expected_version: ExpectedVersion::Exact(0),
                events: vec![event(a, "orders.order")],
            },
            StreamAppend {
                aggregate_id: a,
                expected_version: ExpectedVersion::Exact(1),
                events: vec![event(a, "orders.order")],
            },
        ];
        assert!(matches!(validate_batch(&twice), Err(EventStoreError::InvalidAppend(_))));

        let foreign = vec![StreamAppend {
            aggregate_id: a,
            expected_version: ExpectedVersion::Exact(0),
            events: vec![event(a, "orders.order"), event(b, "orders.order")],
        }];
        assert!(matches!(validate_batch(&foreign), Err(EventStoreError::InvalidAppend(_))));

        let mixed = vec![StreamAppend {
            aggregate_id: a,
            expected_version: ExpectedVersion::Exact(0),
            events: vec![event(a, "orders.order"), event(a, "invoicing.invoice")],
        }];
        assert!(matches!(
            validate_batch(&mixed),
            Err(EventStoreError::AggregateTypeMismatch(_))
        ));

        let fine = vec![
            StreamAppend {
                aggregate_id: a,
                expected_version: ExpectedVersion::Exact(0),
                events: vec![event(a, "orders.order")],
            },
            StreamAppend {
                aggregate_id: b,
                expected_version: ExpectedVersion::Exact(3),
                events: vec![event(b, "invoicing.invoice")],
            },
        ];
        assert!(validate_batch(&fine).is_ok());
    }

    #[test]
    fn infrastructure_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("load_stream", sqlx::Error::PoolClosed),
            EventStoreError::Unavailable(_)
        ));
    }

    /// Runs against a real database: `DATABASE_URL=... cargo test -- --ignored`.
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs DATABASE_URL"]
    async fn appends_are_versioned_and_atomic() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = crate::postgres::connect(&url).await.unwrap();
        crate::postgres::ensure_schema(&pool).await.unwrap();
        let store = PostgresEventStore::new(pool, Handle::current());

        let a = AggregateId::new();
        let b = AggregateId::new();
        let first = store
            .append(vec![event(a, "orders.order")], ExpectedVersion::Exact(0))
            .unwrap();
        assert_eq!(first[0].sequence_number, 1);

        let stale = store.append(vec![event(a, "orders.order")], ExpectedVersion::Exact(0));
        assert!(matches!(stale, Err(EventStoreError::Concurrency(_))));

        // One stale stream keeps the other from being written.
        let batch = store.append_batch(vec![
            StreamAppend {
                aggregate_id: b,
                expected_version: ExpectedVersion::Exact(0),
                events: vec![event(b, "invoicing.invoice")],
            },
            StreamAppend {
                aggregate_id: a,
                expected_version: ExpectedVersion::Exact(0),
                events: vec![event(a, "orders.order")],
            },
        ]);
        assert!(matches!(batch, Err(EventStoreError::Concurrency(_))));
        assert!(store.load_stream(b).unwrap().is_empty());

        let mismatch = store.append(vec![event(a, "invoicing.invoice")], ExpectedVersion::Exact(1));
        assert!(matches!(mismatch, Err(EventStoreError::AggregateTypeMismatch(_))));

        assert_eq!(store.load_stream(a).unwrap().len(), 1);
        assert!(store.list_streams("orders.order").unwrap().contains(&a));
    }
}
