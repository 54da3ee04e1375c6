//! Durable log of raw webhook deliveries.
//!
//! A log row is immutable once inserted. Processing progress is tracked next
//! to it and only ever moves forward, except `release`, which hands a claimed
//! log back after an infrastructure failure. A claim is a lease: a log left
//! in `Processing` longer than the lease (its worker died) can be claimed
//! again.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::WebhookLogId;

use super::WebhookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    /// Payment-link gateway.
    PayOs,
    /// Bank-transfer notifications.
    Sepay,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::PayOs => "payos",
            WebhookSource::Sepay => "sepay",
        }
    }
}

impl fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookSource {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "payos" => Ok(WebhookSource::PayOs),
            "sepay" => Ok(WebhookSource::Sepay),
            other => Err(WebhookError::UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: WebhookLogId,
    pub source: WebhookSource,
    pub raw_payload: Vec<u8>,
    pub signature: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ProcessingState {
    Received,
    Processing,
    Processed,
    Ignored(String),
    Failed(String),
}

impl ProcessingState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessingState::Processed | ProcessingState::Ignored(_) | ProcessingState::Failed(_)
        )
    }
}

pub trait WebhookLogStore: Send + Sync {
    fn insert(&self, log: WebhookLog) -> Result<(), WebhookError>;

    fn get(&self, id: WebhookLogId) -> Result<Option<(WebhookLog, ProcessingState)>, WebhookError>;

    /// Atomically move the log to `Processing`, stamping the claim with
    /// `now`. Granted for `Received` logs and for `Processing` logs whose
    /// claim is older than `lease`. Returns `false` otherwise.
    fn claim(&self, id: WebhookLogId, now: DateTime<Utc>, lease: Duration)
    -> Result<bool, WebhookError>;

    /// Record the final state of a claimed log.
    fn finish(&self, id: WebhookLogId, state: ProcessingState) -> Result<(), WebhookError>;

    /// Return a claimed log to `Received` so it can be processed again.
    fn release(&self, id: WebhookLogId) -> Result<(), WebhookError>;

    /// Logs a worker may claim right now, oldest first: every `Received`
    /// log plus `Processing` logs whose lease has run out.
    fn list_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<WebhookLogId>, WebhookError>;
}

impl<T: WebhookLogStore + ?Sized> WebhookLogStore for std::sync::Arc<T> {
    fn insert(&self, log: WebhookLog) -> Result<(), WebhookError> {
        (**self).insert(log)
    }

    fn get(&self, id: WebhookLogId) -> Result<Option<(WebhookLog, ProcessingState)>, WebhookError> {
        (**self).get(id)
    }

    fn claim(
        &self,
        id: WebhookLogId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, WebhookError> {
        (**self).claim(id, now, lease)
    }

    fn finish(&self, id: WebhookLogId, state: ProcessingState) -> Result<(), WebhookError> {
        (**self).finish(id, state)
    }

    fn release(&self, id: WebhookLogId) -> Result<(), WebhookError> {
        (**self).release(id)
    }

    fn list_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<WebhookLogId>, WebhookError> {
        (**self).list_pending(now, lease)
    }
}

#[derive(Debug)]
struct Entry {
    log: WebhookLog,
    state: ProcessingState,
    claimed_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match (&self.state, self.claimed_at) {
            (ProcessingState::Received, _) => true,
            (ProcessingState::Processing, Some(at)) => at + lease <= now,
            (ProcessingState::Processing, None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<WebhookLogId, Entry>,
    order: Vec<WebhookLogId>,
}

#[derive(Debug, Default)]
pub struct InMemoryWebhookLogStore {
    entries: RwLock<Entries>,
}

impl InMemoryWebhookLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> WebhookError {
        WebhookError::Store("webhook log lock poisoned".to_string())
    }
}

impl WebhookLogStore for InMemoryWebhookLogStore {
    fn insert(&self, log: WebhookLog) -> Result<(), WebhookError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.by_id.contains_key(&log.id) {
            return Err(WebhookError::Store(format!("log {} already exists", log.id)));
        }
        entries.order.push(log.id);
        entries.by_id.insert(
            log.id,
            Entry {
                log,
                state: ProcessingState::Received,
                claimed_at: None,
            },
        );
        Ok(())
    }

    fn get(&self, id: WebhookLogId) -> Result<Option<(WebhookLog, ProcessingState)>, WebhookError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .by_id
            .get(&id)
            .map(|e| (e.log.clone(), e.state.clone())))
    }

    fn claim(
        &self,
        id: WebhookLogId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, WebhookError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries
            .by_id
            .get_mut(&id)
            .ok_or(WebhookError::NotFound(id))?;
        if !entry.claimable(now, lease) {
            return Ok(false);
        }
        if entry.state == ProcessingState::Processing {
            tracing::warn!(log_id = %id, claimed_at = ?entry.claimed_at, "reclaiming stale webhook log");
        }
        entry.state = ProcessingState::Processing;
        entry.claimed_at = Some(now);
        Ok(true)
    }

    fn finish(&self, id: WebhookLogId, next: ProcessingState) -> Result<(), WebhookError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries
            .by_id
            .get_mut(&id)
            .ok_or(WebhookError::NotFound(id))?;
        if entry.state.is_final() {
            return Err(WebhookError::Store(format!("log {id} is already finished")));
        }
        entry.state = next;
        Ok(())
    }

    fn release(&self, id: WebhookLogId) -> Result<(), WebhookError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries
            .by_id
            .get_mut(&id)
            .ok_or(WebhookError::NotFound(id))?;
        if entry.state == ProcessingState::Processing {
            entry.state = ProcessingState::Received;
            entry.claimed_at = None;
        }
        Ok(())
    }

    fn list_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<WebhookLogId>, WebhookError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .order
            .iter()
            .filter(|id| {
                entries
                    .by_id
                    .get(id)
                    .is_some_and(|e| e.claimable(now, lease))
            })
            .copied()
            .collect())
    }
}
