//! Invoice lookup read model.
//!
//! Maps gateway references and open invoice numbers to invoice ids so
//! webhook reconciliation resolves an invoice without rehydrating every
//! invoice stream. Fed from committed invoice events on the bus; seeded from
//! the event store on first use.
//!
//! - **Rebuildable**: any stream can be reloaded from the store
//! - **Idempotent**: envelopes at or below a stream's cursor are skipped

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;

use podledger_core::AggregateId;
use podledger_events::{EventBus, EventEnvelope, Subscription};
use podledger_invoicing::{InvoiceEvent, InvoiceId};

use crate::command_dispatcher::DispatchError;
use crate::event_store::{EventStore, EventStoreError, StoredEvent};
use crate::streams::INVOICE_STREAM;
use crate::webhook::parser::normalize_invoice_text;

/// Invoice number prefix as it appears once normalized.
const NUMBER_PREFIX: &str = "INV";

#[derive(Debug, Error)]
pub enum InvoiceLookupError {
    #[error("failed to deserialize invoice event: {0}")]
    Deserialize(String),

    #[error("invoice {aggregate_id} skipped from sequence {last} to {found}")]
    Gap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("invoice lookup lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl From<InvoiceLookupError> for DispatchError {
    fn from(value: InvoiceLookupError) -> Self {
        match value {
            InvoiceLookupError::Store(err) => err.into(),
            InvoiceLookupError::Deserialize(msg) => DispatchError::Deserialize(msg),
            other => DispatchError::Store(EventStoreError::Unavailable(other.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct LookupState {
    seeded: bool,
    cursors: HashMap<AggregateId, u64>,
    by_reference: HashMap<String, InvoiceId>,
    /// Normalized number of every invoice that is not cancelled.
    open_by_number: HashMap<String, InvoiceId>,
    number_lengths: BTreeSet<usize>,
}

impl LookupState {
    fn apply(
        &mut self,
        aggregate_id: AggregateId,
        sequence_number: u64,
        payload: &JsonValue,
    ) -> Result<(), InvoiceLookupError> {
        let last = self.cursors.get(&aggregate_id).copied().unwrap_or(0);
        if sequence_number <= last {
            return Ok(());
        }
        if sequence_number != last + 1 {
            return Err(InvoiceLookupError::Gap {
                aggregate_id,
                last,
                found: sequence_number,
            });
        }

        let event: InvoiceEvent = serde_json::from_value(payload.clone())
            .map_err(|e| InvoiceLookupError::Deserialize(e.to_string()))?;
        let invoice_id = InvoiceId::new(aggregate_id);

        match event {
            InvoiceEvent::InvoiceIssued(e) => {
                let number = normalize_invoice_text(&e.number);
                if !number.is_empty() {
                    self.number_lengths.insert(number.len());
                    self.open_by_number.insert(number, invoice_id);
                }
            }
            InvoiceEvent::PaymentInitiated(e) => {
                self.remember(e.payment.gateway_reference, invoice_id)
            }
            InvoiceEvent::PaymentRecorded(e) => {
                self.remember(e.payment.gateway_reference, invoice_id)
            }
            InvoiceEvent::RefundPosted(e) => self.remember(e.payment.gateway_reference, invoice_id),
            InvoiceEvent::InvoiceCancelled(_) => {
                self.open_by_number.retain(|_, id| *id != invoice_id);
            }
            InvoiceEvent::PaymentCompleted(_)
            | InvoiceEvent::PaymentFailed(_)
            | InvoiceEvent::RefundCredited(_) => {}
        }

        self.cursors.insert(aggregate_id, sequence_number);
        Ok(())
    }

    fn remember(&mut self, reference: Option<String>, invoice_id: InvoiceId) {
        if let Some(reference) = reference {
            self.by_reference.entry(reference).or_insert(invoice_id);
        }
    }

    fn forget(&mut self, aggregate_id: AggregateId) {
        let invoice_id = InvoiceId::new(aggregate_id);
        self.cursors.remove(&aggregate_id);
        self.by_reference.retain(|_, id| *id != invoice_id);
        self.open_by_number.retain(|_, id| *id != invoice_id);
    }

    fn replace_stream(
        &mut self,
        aggregate_id: AggregateId,
        history: &[StoredEvent],
    ) -> Result<(), InvoiceLookupError> {
        self.forget(aggregate_id);
        for stored in history {
            self.apply(aggregate_id, stored.sequence_number, &stored.payload)?;
        }
        Ok(())
    }

    fn number_in(&self, description: &str) -> Option<InvoiceId> {
        let text = normalize_invoice_text(description);
        text.match_indices(NUMBER_PREFIX).find_map(|(start, _)| {
            self.number_lengths.iter().find_map(|len| {
                text.get(start..start + len)
                    .and_then(|candidate| self.open_by_number.get(candidate))
                    .copied()
            })
        })
    }
}

/// Reference and number index over invoice streams.
pub struct InvoiceLookup {
    subscription: Mutex<Subscription<EventEnvelope<JsonValue>>>,
    state: RwLock<LookupState>,
}

impl std::fmt::Debug for InvoiceLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceLookup").finish_non_exhaustive()
    }
}

impl InvoiceLookup {
    /// Subscribe to `bus`. Nothing is read from the store until the first
    /// [`sync`](Self::sync).
    pub fn subscribe<B: EventBus<EventEnvelope<JsonValue>>>(bus: &B) -> Self {
        Self {
            subscription: Mutex::new(bus.subscribe()),
            state: RwLock::new(LookupState::default()),
        }
    }

    /// Apply every envelope published since the last call, seeding from the
    /// store first if this is the first sync. A stream whose envelopes skip
    /// a sequence number was written elsewhere and is reloaded whole.
    pub fn sync<S: EventStore>(&self, store: &S) -> Result<(), InvoiceLookupError> {
        let pending = self
            .subscription
            .lock()
            .map_err(|_| InvoiceLookupError::Poisoned)?
            .drain();
        let mut state = self.state.write().map_err(|_| InvoiceLookupError::Poisoned)?;

        if !state.seeded {
            let streams = store.list_streams(INVOICE_STREAM)?;
            for aggregate_id in &streams {
                let history = store.load_stream(*aggregate_id)?;
                state.replace_stream(*aggregate_id, &history)?;
            }
            state.seeded = true;
            tracing::debug!(invoices = streams.len(), "invoice lookup seeded");
        }

        for envelope in pending {
            if envelope.aggregate_type() != INVOICE_STREAM {
                continue;
            }
            let aggregate_id = envelope.aggregate_id();
            match state.apply(aggregate_id, envelope.sequence_number(), envelope.payload()) {
                Ok(()) => {}
                Err(InvoiceLookupError::Gap { last, found, .. }) => {
                    tracing::debug!(%aggregate_id, last, found, "reloading invoice stream");
                    let history = store.load_stream(aggregate_id)?;
                    state.replace_stream(aggregate_id, &history)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Load invoice streams this lookup has never seen, e.g. ones created by
    /// another process sharing the store.
    pub fn catch_up<S: EventStore>(&self, store: &S) -> Result<usize, InvoiceLookupError> {
        let mut state = self.state.write().map_err(|_| InvoiceLookupError::Poisoned)?;
        let unseen: Vec<AggregateId> = store
            .list_streams(INVOICE_STREAM)?
            .into_iter()
            .filter(|id| !state.cursors.contains_key(id))
            .collect();
        for aggregate_id in &unseen {
            let history = store.load_stream(*aggregate_id)?;
            state.replace_stream(*aggregate_id, &history)?;
        }
        Ok(unseen.len())
    }

    pub fn by_reference(&self, reference: &str) -> Result<Option<InvoiceId>, InvoiceLookupError> {
        let state = self.state.read().map_err(|_| InvoiceLookupError::Poisoned)?;
        Ok(state.by_reference.get(reference).copied())
    }

    /// Open invoice whose number appears in `description`, first mention
    /// wins.
    pub fn by_description(&self, description: &str) -> Result<Option<InvoiceId>, InvoiceLookupError> {
        let state = self.state.read().map_err(|_| InvoiceLookupError::Poisoned)?;
        Ok(state.number_in(description))
    }
}
