//! Postgres-backed webhook log.
//!
//! Claims are conditional updates, so two workers racing for the same log
//! cannot both win. The claim stamp lives in `claimed_at`; a `processing`
//! row whose stamp is older than the lease is claimable again.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use podledger_core::WebhookLogId;

use super::WebhookError;
use super::log::{ProcessingState, WebhookLog, WebhookLogStore, WebhookSource};
use crate::postgres::{block_on, is_unique_violation};

#[derive(Debug, Clone)]
pub struct PostgresWebhookLogStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresWebhookLogStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    #[instrument(skip(self, log), fields(log_id = %log.id), err)]
    pub async fn insert_async(&self, log: WebhookLog) -> Result<(), WebhookError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs (id, source, raw_payload, signature, received_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(*log.id.as_uuid())
        .bind(log.source.as_str())
        .bind(&log.raw_payload)
        .bind(&log.signature)
        .bind(log.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                WebhookError::Store(format!("log {} already exists", log.id))
            } else {
                store_error("insert", e)
            }
        })?;
        Ok(())
    }

    pub async fn get_async(
        &self,
        id: WebhookLogId,
    ) -> Result<Option<(WebhookLog, ProcessingState)>, WebhookError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, raw_payload, signature, received_at, state, reason
            FROM webhook_logs
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(log_id = %id), err)]
    pub async fn claim_async(
        &self,
        id: WebhookLogId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_logs
            SET state = 'processing', claimed_at = $2
            WHERE id = $1
              AND (state = 'received'
                   OR (state = 'processing' AND (claimed_at IS NULL OR claimed_at <= $3)))
            RETURNING (SELECT state FROM webhook_logs WHERE id = $1) AS previous_state
            "#,
        )
        .bind(*id.as_uuid())
        .bind(now)
        .bind(now - lease)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("claim", e))?;

        match result {
            Some(row) => {
                let previous: String = row
                    .try_get("previous_state")
                    .map_err(|e| store_error("claim", e))?;
                if previous == "processing" {
                    tracing::warn!(log_id = %id, "reclaiming stale webhook log");
                }
                Ok(true)
            }
            None => {
                self.require_exists(id).await?;
                Ok(false)
            }
        }
    }

    #[instrument(skip(self), fields(log_id = %id), err)]
    pub async fn finish_async(
        &self,
        id: WebhookLogId,
        next: ProcessingState,
    ) -> Result<(), WebhookError> {
        let (state, reason) = state_columns(&next);
        let result = sqlx::query(
            r#"
            UPDATE webhook_logs
            SET state = $2, reason = $3
            WHERE id = $1 AND state IN ('received', 'processing')
            "#,
        )
        .bind(*id.as_uuid())
        .bind(state)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("finish", e))?;

        if result.rows_affected() == 0 {
            self.require_exists(id).await?;
            return Err(WebhookError::Store(format!("log {id} is already finished")));
        }
        Ok(())
    }

    pub async fn release_async(&self, id: WebhookLogId) -> Result<(), WebhookError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_logs
            SET state = 'received', claimed_at = NULL
            WHERE id = $1 AND state = 'processing'
            "#,
        )
        .bind(*id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("release", e))?;

        if result.rows_affected() == 0 {
            self.require_exists(id).await?;
        }
        Ok(())
    }

    pub async fn list_pending_async(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<WebhookLogId>, WebhookError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM webhook_logs
            WHERE state = 'received'
               OR (state = 'processing' AND (claimed_at IS NULL OR claimed_at <= $1))
            ORDER BY position ASC
            "#,
        )
        .bind(now - lease)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("list_pending", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(WebhookLogId::from_uuid)
                    .map_err(|e| store_error("list_pending", e))
            })
            .collect()
    }

    async fn require_exists(&self, id: WebhookLogId) -> Result<(), WebhookError> {
        let found = sqlx::query("SELECT 1 FROM webhook_logs WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("lookup", e))?;
        found.map(|_| ()).ok_or(WebhookError::NotFound(id))
    }

    fn run<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, WebhookError>>,
    ) -> Result<T, WebhookError> {
        block_on(&self.runtime, fut, WebhookError::Store)
    }
}

impl WebhookLogStore for PostgresWebhookLogStore {
    fn insert(&self, log: WebhookLog) -> Result<(), WebhookError> {
        self.run(self.insert_async(log))
    }

    fn get(&self, id: WebhookLogId) -> Result<Option<(WebhookLog, ProcessingState)>, WebhookError> {
        self.run(self.get_async(id))
    }

    fn claim(
        &self,
        id: WebhookLogId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, WebhookError> {
        self.run(self.claim_async(id, now, lease))
    }

    fn finish(&self, id: WebhookLogId, state: ProcessingState) -> Result<(), WebhookError> {
        self.run(self.finish_async(id, state))
    }

    fn release(&self, id: WebhookLogId) -> Result<(), WebhookError> {
        self.run(self.release_async(id))
    }

    fn list_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<WebhookLogId>, WebhookError> {
        self.run(self.list_pending_async(now, lease))
    }
}

fn store_error(operation: &str, err: sqlx::Error) -> WebhookError {
    WebhookError::Store(format!("{operation}: {err}"))
}

/// Column values for a processing state.
fn state_columns(state: &ProcessingState) -> (&'static str, Option<&str>) {
    match state {
        ProcessingState::Received => ("received", None),
        ProcessingState::Processing => ("processing", None),
        ProcessingState::Processed => ("processed", None),
        ProcessingState::Ignored(reason) => ("ignored", Some(reason)),
        ProcessingState::Failed(reason) => ("failed", Some(reason)),
    }
}

fn decode_state(state: &str, reason: Option<String>) -> Result<ProcessingState, WebhookError> {
    match state {
        "received" => Ok(ProcessingState::Received),
        "processing" => Ok(ProcessingState::Processing),
        "processed" => Ok(ProcessingState::Processed),
        "ignored" => Ok(ProcessingState::Ignored(reason.unwrap_or_default())),
        "failed" => Ok(ProcessingState::Failed(reason.unwrap_or_default())),
        other => Err(WebhookError::Store(format!("unknown webhook log state '{other}'"))),
    }
}

fn decode_row(row: &PgRow) -> Result<(WebhookLog, ProcessingState), WebhookError> {
    let column = |e: sqlx::Error| store_error("decode", e);
    let source: String = row.try_get("source").map_err(column)?;
    let log = WebhookLog {
        id: WebhookLogId::from_uuid(row.try_get("id").map_err(column)?),
        source: source.parse::<WebhookSource>()?,
        raw_payload: row.try_get("raw_payload").map_err(column)?,
        signature: row.try_get("signature").map_err(column)?,
        received_at: row.try_get("received_at").map_err(column)?,
    };
    let state: String = row.try_get("state").map_err(column)?;
    let reason: Option<String> = row.try_get("reason").map_err(column)?;
    Ok((log, decode_state(&state, reason)?))
}
