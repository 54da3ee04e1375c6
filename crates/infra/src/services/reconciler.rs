//! Webhook reconciliation: durable ingest, then idempotent processing.
//!
//! The raw delivery is logged before anything is interpreted. Processing
//! claims the log first, so a log is worked on by one worker at a time;
//! duplicate deliveries of the same gateway reference collapse into no-ops
//! at the invoice. A claim whose worker never finished expires after the
//! claim lease and is picked up again by `replay_unprocessed`.

use std::sync::Arc;

use chrono::{Duration, Utc};

use podledger_auth::Principal;
use podledger_core::{ErrorKind, WebhookLogId};

use super::EnvelopeBus;
use super::payments::{AllocationOutcome, ManualPayment, PaymentAllocationEngine};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::webhook::parser::{self, ParsedWebhook, PaymentNotice, PaymentOutcome};
use crate::webhook::signature;
use crate::webhook::{ProcessingState, WebhookError, WebhookLog, WebhookLogStore, WebhookSource};

/// Per-source HMAC secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSecrets {
    pub payos: String,
    pub sepay: String,
}

impl WebhookSecrets {
    fn for_source(&self, source: WebhookSource) -> &str {
        match source {
            WebhookSource::PayOs => &self.payos,
            WebhookSource::Sepay => &self.sepay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A payment was completed, failed or recorded.
    Processed,
    /// The gateway reference was already settled.
    Duplicate,
    Ignored(String),
    /// Acknowledged, but no retry can make it succeed.
    Rejected(String),
    /// Another worker claimed or finished the log first.
    AlreadyHandled,
}

pub struct WebhookReconciler<S, B> {
    engine: Arc<PaymentAllocationEngine<S, B>>,
    logs: Arc<dyn WebhookLogStore>,
    secrets: WebhookSecrets,
    claim_lease: Duration,
}

impl<S, B> WebhookReconciler<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        engine: Arc<PaymentAllocationEngine<S, B>>,
        logs: Arc<dyn WebhookLogStore>,
        secrets: WebhookSecrets,
        claim_lease: Duration,
    ) -> Self {
        Self {
            engine,
            logs,
            secrets,
            claim_lease,
        }
    }

    /// Persist a raw delivery. Nothing is interpreted yet.
    pub fn ingest(
        &self,
        source: WebhookSource,
        raw_payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookLogId, WebhookError> {
        let id = WebhookLogId::new();
        self.logs.insert(WebhookLog {
            id,
            source,
            raw_payload: raw_payload.to_vec(),
            signature: signature.map(str::to_string),
            received_at: Utc::now(),
        })?;
        tracing::debug!(log_id = %id, source = %source, "webhook logged");
        Ok(id)
    }

    /// Endpoint entry point: log, then process.
    pub fn handle(
        &self,
        source: &str,
        raw_payload: &[u8],
        signature: Option<&str>,
    ) -> Result<(WebhookLogId, ProcessOutcome), WebhookError> {
        let source: WebhookSource = source.parse()?;
        let id = self.ingest(source, raw_payload, signature)?;
        let outcome = self.process(id)?;
        Ok((id, outcome))
    }

    #[tracing::instrument(skip_all, fields(log_id = %log_id))]
    pub fn process(&self, log_id: WebhookLogId) -> Result<ProcessOutcome, WebhookError> {
        let (log, _) = self.logs.get(log_id)?.ok_or(WebhookError::NotFound(log_id))?;

        if !self.logs.claim(log_id, Utc::now(), self.claim_lease)? {
            return Ok(ProcessOutcome::AlreadyHandled);
        }

        let secret = self.secrets.for_source(log.source);
        let signed = log
            .signature
            .as_deref()
            .is_some_and(|sig| signature::verify(secret, &log.raw_payload, sig));
        if !signed {
            tracing::warn!(source = %log.source, "webhook signature rejected");
            self.logs
                .finish(log_id, ProcessingState::Failed("signature".to_string()))?;
            return Err(WebhookError::Signature);
        }

        let parsed = match parser::parse(log.source, &log.raw_payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "malformed webhook payload");
                self.logs
                    .finish(log_id, ProcessingState::Failed(format!("malformed: {err}")))?;
                return Err(err);
            }
        };

        let notice = match parsed {
            ParsedWebhook::Ping => {
                self.logs
                    .finish(log_id, ProcessingState::Ignored("ping".to_string()))?;
                return Ok(ProcessOutcome::Ignored("ping".to_string()));
            }
            ParsedWebhook::Ignored(reason) => {
                self.logs
                    .finish(log_id, ProcessingState::Ignored(reason.clone()))?;
                return Ok(ProcessOutcome::Ignored(reason));
            }
            ParsedWebhook::Payment(notice) => notice,
        };

        match self.apply(&notice) {
            Ok(outcome) => {
                let state = match &outcome {
                    ProcessOutcome::Rejected(reason) => ProcessingState::Failed(reason.clone()),
                    ProcessOutcome::Ignored(reason) => ProcessingState::Ignored(reason.clone()),
                    _ => ProcessingState::Processed,
                };
                self.logs.finish(log_id, state)?;
                Ok(outcome)
            }
            Err(err) if is_business_rejection(&err) => {
                let reason = err.to_string();
                tracing::warn!(reference = %notice.reference, reason = %reason, "webhook payment rejected");
                self.logs
                    .finish(log_id, ProcessingState::Failed(reason.clone()))?;
                Ok(ProcessOutcome::Rejected(reason))
            }
            Err(err) => {
                tracing::warn!(error = %err, "webhook processing failed; log released for retry");
                self.logs.release(log_id)?;
                Err(WebhookError::Processing(err.to_string()))
            }
        }
    }

    /// Re-drive every log still waiting, oldest first, including logs whose
    /// claim lease ran out while `Processing`.
    pub fn replay_unprocessed(
        &self,
    ) -> Result<Vec<(WebhookLogId, Result<ProcessOutcome, WebhookError>)>, WebhookError> {
        let pending = self.logs.list_pending(Utc::now(), self.claim_lease)?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "replaying unprocessed webhooks");
        }
        Ok(pending
            .into_iter()
            .map(|id| (id, self.process(id)))
            .collect())
    }

    fn apply(&self, notice: &PaymentNotice) -> Result<ProcessOutcome, DispatchError> {
        if let PaymentOutcome::Failed(reason) = &notice.outcome {
            return match self.engine.find_by_reference(&notice.reference)? {
                Some(invoice_id) => {
                    self.engine
                        .fail_payment(invoice_id, &notice.reference, reason)?;
                    Ok(ProcessOutcome::Processed)
                }
                None => Ok(ProcessOutcome::Ignored(format!(
                    "failure for unknown reference {}",
                    notice.reference
                ))),
            };
        }

        if let Some(invoice_id) = self.engine.find_by_reference(&notice.reference)? {
            let outcome = self
                .engine
                .complete_payment(invoice_id, &notice.reference, notice.amount)?;
            return Ok(settled(outcome));
        }

        if let Some(invoice_id) = self.engine.find_by_description(&notice.description)? {
            let outcome = self.engine.record_payment(
                &Principal::system(),
                invoice_id,
                ManualPayment {
                    amount: notice.amount,
                    method: notice.method,
                    gateway_reference: Some(notice.reference.clone()),
                },
            )?;
            return Ok(settled(outcome));
        }

        Ok(ProcessOutcome::Rejected(format!(
            "no invoice matches reference {}",
            notice.reference
        )))
    }
}

fn settled(outcome: AllocationOutcome) -> ProcessOutcome {
    if outcome.applied {
        tracing::info!(
            number = outcome.invoice.number(),
            amount_paid = outcome.invoice.amount_paid(),
            "webhook payment applied"
        );
        ProcessOutcome::Processed
    } else {
        ProcessOutcome::Duplicate
    }
}

/// Failures a provider retry cannot fix.
fn is_business_rejection(err: &DispatchError) -> bool {
    match err {
        DispatchError::Domain(_) | DispatchError::Concurrency(_) => {
            !matches!(err.kind(), Some(ErrorKind::ExternalGateway))
        }
        DispatchError::Deserialize(_) | DispatchError::Store(_) | DispatchError::Publish(_) => false,
    }
}
