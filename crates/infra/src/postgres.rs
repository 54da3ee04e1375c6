//! Shared Postgres plumbing: pool setup, schema and the bridge from the
//! synchronous store traits onto sqlx's async API.
//!
//! The stores capture a runtime [`Handle`] when they are built. Calls made
//! from a multi-threaded runtime worker move off the worker with
//! `block_in_place` before blocking on the query; calls from plain threads
//! block on the handle directly. A current-thread runtime cannot be blocked
//! on from inside itself, so calls from one fail with an error instead.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Tables and indexes owned by this service. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        global_position BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        aggregate_id UUID NOT NULL,
        aggregate_type TEXT NOT NULL,
        sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
        event_type TEXT NOT NULL,
        event_version INTEGER NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (aggregate_id, sequence_number)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS events_stream_heads
        ON events (aggregate_type, global_position)
        WHERE sequence_number = 1
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_logs (
        position BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        source TEXT NOT NULL,
        raw_payload BYTEA NOT NULL,
        signature TEXT,
        received_at TIMESTAMPTZ NOT NULL,
        state TEXT NOT NULL DEFAULT 'received',
        reason TEXT,
        claimed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS webhook_logs_pending
        ON webhook_logs (position)
        WHERE state IN ('received', 'processing')
    "#,
];

/// Open a connection pool against `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Create the tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("postgres schema ready");
    Ok(())
}

/// Drive `fut` to completion on `handle` from synchronous code.
///
/// `unavailable` builds the caller's error when blocking is impossible.
pub(crate) fn block_on<F, T, E>(
    handle: &Handle,
    fut: F,
    unavailable: impl FnOnce(String) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match Handle::try_current() {
        Err(_) => handle.block_on(fut),
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        Ok(_) => Err(unavailable(
            "postgres stores need a multi-threaded tokio runtime".to_string(),
        )),
    }
}

/// SQLSTATE of a database error, if any.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_on_the_handle_from_plain_threads() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let out: Result<u32, String> = block_on(runtime.handle(), async { Ok(7) }, |m| m);
        assert_eq!(out, Ok(7));
    }

    #[test]
    fn refuses_to_block_a_current_thread_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        let out: Result<u32, String> =
            runtime.block_on(async move { block_on(&handle, async { Ok(7) }, |m| m) });
        assert!(out.unwrap_err().contains("multi-threaded"));
    }

    #[test]
    fn non_database_errors_have_no_sqlstate() {
        assert_eq!(sqlstate(&sqlx::Error::PoolClosed), None);
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
