//! Payment allocation against invoices.
//!
//! Every allocation is decided against a freshly loaded invoice and appended
//! with that invoice's stream version. A concurrent allocation makes the
//! append fail; the attempt is then repeated against new state, so the
//! balance check always sees every committed payment.

use std::sync::Arc;

use chrono::Utc;

use podledger_auth::{Permission, Principal, authorize};
use podledger_core::{AggregateId, DomainError, PaymentId};
use podledger_invoicing::{
    CompletePayment, FailPayment, InitiatePayment, Invoice, InvoiceCommand, InvoiceId,
    PaymentMethod, RecordPayment, RecordRefund,
};
use podledger_orders::OrderId;

use super::{EnvelopeBus, ensure_owner_or, load_invoice};
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::external::{PaymentGateway, PaymentLink, PaymentLinkRequest, gateway_reference};
use crate::projections::{InvoiceLookup, InvoiceLookupError};
use crate::retry::with_retries;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualPayment {
    pub amount: u64,
    pub method: PaymentMethod,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub invoice: Invoice,
    /// `false` when the payment was already on the invoice.
    pub applied: bool,
}

pub struct PaymentAllocationEngine<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    gateway: Arc<dyn PaymentGateway>,
    lookup: InvoiceLookup,
    max_retries: u32,
}

impl<S, B> PaymentAllocationEngine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        gateway: Arc<dyn PaymentGateway>,
        max_retries: u32,
    ) -> Self {
        let lookup = InvoiceLookup::subscribe(dispatcher.bus());
        Self {
            dispatcher,
            gateway,
            lookup,
            max_retries,
        }
    }

    /// Record a completed charge. Amounts beyond the outstanding balance are
    /// rejected with `AmountExceedsBalance`; a gateway reference already
    /// settled on the invoice is a no-op.
    #[tracing::instrument(skip_all, fields(invoice_id = %invoice_id, amount = payment.amount))]
    pub fn record_payment(
        &self,
        principal: &Principal,
        invoice_id: InvoiceId,
        payment: ManualPayment,
    ) -> Result<AllocationOutcome, DispatchError> {
        authorize(principal, &Permission::PAYMENTS_RECORD)?;
        let actor = principal.user_id;
        let payment_id = PaymentId::new();

        let outcome = self.allocate(invoice_id, "payments.record", || {
            InvoiceCommand::RecordPayment(RecordPayment {
                invoice_id,
                payment_id,
                amount: payment.amount,
                method: payment.method,
                gateway_reference: payment.gateway_reference.clone(),
                actor,
                occurred_at: Utc::now(),
            })
        })?;

        if outcome.applied {
            tracing::info!(
                amount_paid = outcome.invoice.amount_paid(),
                status = ?outcome.invoice.status(),
                "payment recorded"
            );
        } else {
            tracing::info!("payment already recorded; nothing to do");
        }
        Ok(outcome)
    }

    /// Ask the gateway for a checkout link and track it as a pending payment.
    /// `amount` defaults to the outstanding balance. Confirmation only ever
    /// arrives through the webhook.
    #[tracing::instrument(skip_all, fields(invoice_id = %invoice_id))]
    pub fn create_payment_link(
        &self,
        principal: &Principal,
        invoice_id: InvoiceId,
        amount: Option<u64>,
    ) -> Result<PaymentLink, DispatchError> {
        authorize(principal, &Permission::PAYMENTS_LINK)?;
        let invoice = load_invoice(&self.dispatcher, invoice_id)?.aggregate;
        ensure_owner_or(principal, invoice.seller_id(), &Permission::PAYMENTS_RECORD)?;

        if invoice.is_cancelled() {
            return Err(DomainError::conflict(format!("invoice {} is cancelled", invoice.number())).into());
        }
        let balance = invoice.outstanding_amount();
        let amount = amount.unwrap_or(balance);
        if amount == 0 {
            return Err(DomainError::validation("nothing left to pay").into());
        }
        if amount > balance {
            return Err(DomainError::AmountExceedsBalance { amount, balance }.into());
        }

        let payment_id = PaymentId::new();
        let link = self.gateway.create_link(&PaymentLinkRequest {
            invoice_number: invoice.number().to_string(),
            amount,
            reference: gateway_reference(payment_id),
        })?;

        self.allocate(invoice_id, "payments.link", || {
            InvoiceCommand::InitiatePayment(InitiatePayment {
                invoice_id,
                payment_id,
                amount,
                method: PaymentMethod::PaymentLink,
                gateway_reference: link.reference.clone(),
                occurred_at: Utc::now(),
            })
        })?;

        tracing::info!(reference = %link.reference, amount, "payment link created");
        Ok(link)
    }

    /// Settle a pending gateway payment.
    pub fn complete_payment(
        &self,
        invoice_id: InvoiceId,
        reference: &str,
        amount: u64,
    ) -> Result<AllocationOutcome, DispatchError> {
        self.allocate(invoice_id, "payments.complete", || {
            InvoiceCommand::CompletePayment(CompletePayment {
                invoice_id,
                gateway_reference: reference.to_string(),
                amount,
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn fail_payment(
        &self,
        invoice_id: InvoiceId,
        reference: &str,
        reason: &str,
    ) -> Result<AllocationOutcome, DispatchError> {
        self.allocate(invoice_id, "payments.fail", || {
            InvoiceCommand::FailPayment(FailPayment {
                invoice_id,
                gateway_reference: reference.to_string(),
                reason: reason.to_string(),
                occurred_at: Utc::now(),
            })
        })
    }

    /// Stage the invoice side of an approved refund in the caller's unit of
    /// work: the order's amount is credited against the payable and anything
    /// already collected above the reduced payable is paid back. Cancelled
    /// invoices are left alone; their orders are billed again at the
    /// refundable amount.
    pub fn post_refund(
        &self,
        uow: &mut UnitOfWork,
        invoice_id: InvoiceId,
        order_id: OrderId,
        amount: u64,
        request_id: AggregateId,
    ) -> Result<(), DispatchError> {
        let mut invoice = load_invoice(&self.dispatcher, invoice_id)?;
        if invoice.aggregate.is_cancelled() {
            tracing::debug!(
                number = invoice.aggregate.number(),
                "invoice cancelled; refund not credited"
            );
            return Ok(());
        }
        uow.stage(
            &mut invoice,
            InvoiceCommand::RecordRefund(RecordRefund {
                invoice_id,
                payment_id: PaymentId::new(),
                order_id,
                request_id,
                amount,
                occurred_at: Utc::now(),
            }),
        )?;
        Ok(())
    }

    /// Invoice holding a payment with this gateway reference.
    pub fn find_by_reference(&self, reference: &str) -> Result<Option<InvoiceId>, DispatchError> {
        self.find(|lookup| lookup.by_reference(reference))
    }

    /// Open invoice whose number appears in a transfer description.
    pub fn find_by_description(&self, description: &str) -> Result<Option<InvoiceId>, DispatchError> {
        self.find(|lookup| lookup.by_description(description))
    }

    /// Query the lookup after applying newly committed events. A miss
    /// retries once after loading invoice streams the lookup never saw.
    fn find(
        &self,
        query: impl Fn(&InvoiceLookup) -> Result<Option<InvoiceId>, InvoiceLookupError>,
    ) -> Result<Option<InvoiceId>, DispatchError> {
        let store = self.dispatcher.store();
        self.lookup.sync(store)?;
        if let Some(found) = query(&self.lookup)? {
            return Ok(Some(found));
        }
        if self.lookup.catch_up(store)? > 0 {
            return Ok(query(&self.lookup)?);
        }
        Ok(None)
    }

    fn allocate(
        &self,
        invoice_id: InvoiceId,
        operation: &str,
        command: impl Fn() -> InvoiceCommand,
    ) -> Result<AllocationOutcome, DispatchError> {
        with_retries(operation, self.max_retries, |_| {
            let mut invoice = load_invoice(&self.dispatcher, invoice_id)?;
            let mut uow = UnitOfWork::new();
            let events = uow.stage(&mut invoice, command())?;
            self.dispatcher.commit(uow)?;
            Ok(AllocationOutcome {
                invoice: invoice.aggregate,
                applied: !events.is_empty(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use podledger_core::UserId;
    use podledger_events::{EventEnvelope, InMemoryEventBus};
    use podledger_invoicing::{InvoiceItem, IssueInvoice, invoice_number};
    use serde_json::Value as JsonValue;

    use crate::event_store::InMemoryEventStore;
    use crate::external::HostedCheckoutGateway;
    use crate::streams::INVOICE_STREAM;

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn engine(store: &Store) -> PaymentAllocationEngine<Store, Bus> {
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            Arc::new(InMemoryEventBus::new()),
        ));
        PaymentAllocationEngine::new(
            dispatcher,
            Arc::new(HostedCheckoutGateway::new("https://pay.example.test")),
            3,
        )
    }

    fn issue(engine: &PaymentAllocationEngine<Store, Bus>, amount: u64) -> Invoice {
        let invoice_id = InvoiceId::new(AggregateId::new());
        let now = Utc::now();
        let (invoice, _) = engine
            .dispatcher
            .execute(
                invoice_id.0,
                INVOICE_STREAM,
                InvoiceCommand::IssueInvoice(IssueInvoice {
                    invoice_id,
                    number: invoice_number(invoice_id, now),
                    seller_id: UserId::new(),
                    items: vec![InvoiceItem {
                        order_id: OrderId::new(AggregateId::new()),
                        order_code: "ORD-1".to_string(),
                        amount,
                    }],
                    discount: None,
                    due_date: now + Duration::days(15),
                    notes: None,
                    actor: UserId::new(),
                    occurred_at: now,
                }),
                |id| Invoice::empty(InvoiceId::new(id)),
            )
            .unwrap();
        invoice
    }

    #[test]
    fn lookups_follow_new_invoices_and_payment_links() {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);
        assert_eq!(engine.find_by_description("INV-000000-00000000").unwrap(), None);

        let invoice = issue(&engine, 200_000);
        let description = format!("thanh toan {}", invoice.number().to_lowercase());
        assert_eq!(
            engine.find_by_description(&description).unwrap(),
            Some(invoice.id_typed())
        );

        let link = engine
            .create_payment_link(&Principal::manager(UserId::new()), invoice.id_typed(), None)
            .unwrap();
        assert_eq!(
            engine.find_by_reference(&link.reference).unwrap(),
            Some(invoice.id_typed())
        );
        assert_eq!(engine.find_by_reference("sepay:unknown").unwrap(), None);
    }

    #[test]
    fn invoices_issued_by_another_process_are_found() {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let here = engine(&store);
        let elsewhere = engine(&store);
        assert_eq!(here.find_by_reference("payos:1").unwrap(), None);

        let invoice = issue(&elsewhere, 50_000);
        assert_eq!(
            here.find_by_description(invoice.number()).unwrap(),
            Some(invoice.id_typed())
        );
    }
}
