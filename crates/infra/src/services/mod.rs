//! Application services: the operations sellers, staff and payment gateways
//! invoke.
//!
//! Services load aggregates through the [`CommandDispatcher`], decide
//! commands, and commit every touched stream in one
//! [`UnitOfWork`](crate::unit_of_work::UnitOfWork). Authorization runs here,
//! before any command is decided.

pub mod invoices;
pub mod orders;
pub mod payments;
pub mod reconciler;
pub mod workflows;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use podledger_auth::{AuthzError, Permission, Principal, authorize, require_owner};
use podledger_core::{DomainError, UserId};
use podledger_events::{EventBus, EventEnvelope};
use podledger_invoicing::{Invoice, InvoiceId};
use podledger_orders::{Order, OrderId};
use podledger_requests::{RequestId, ReviewRequest};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, Rehydrated};
use crate::config::AppConfig;
use crate::event_store::EventStore;
use crate::external::{DiscountValidator, NotificationService, PaymentGateway, ShipmentTracker};
use crate::streams::{INVOICE_STREAM, ORDER_STREAM, REQUEST_STREAM};
use crate::webhook::WebhookLogStore;

pub use invoices::{AdHocInvoice, InvoiceAggregator, OrderSelection};
pub use orders::{NewOrder, OrderLedgerService};
pub use payments::{AllocationOutcome, ManualPayment, PaymentAllocationEngine};
pub use reconciler::{ProcessOutcome, WebhookReconciler, WebhookSecrets};
pub use workflows::{NewRefund, NewReprint, ReviewWorkflows};

/// Bus carrying serialized event envelopes, as published by the dispatcher.
pub trait EnvelopeBus: EventBus<EventEnvelope<JsonValue>> {}

impl<T: EventBus<EventEnvelope<JsonValue>>> EnvelopeBus for T {}

/// Outside systems the services talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub shipments: Arc<dyn ShipmentTracker>,
    pub notifier: Arc<dyn NotificationService>,
    pub discounts: Arc<dyn DiscountValidator>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub webhook_logs: Arc<dyn WebhookLogStore>,
}

/// Every application service, sharing one dispatcher.
pub struct Services<S, B> {
    pub dispatcher: Arc<CommandDispatcher<S, B>>,
    pub orders: OrderLedgerService<S, B>,
    pub invoices: InvoiceAggregator<S, B>,
    pub payments: Arc<PaymentAllocationEngine<S, B>>,
    pub reconciler: WebhookReconciler<S, B>,
    pub workflows: ReviewWorkflows<S, B>,
}

impl<S, B> Services<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        collaborators: Collaborators,
        config: &AppConfig,
    ) -> Self {
        let retries = config.allocation_max_retries;
        let payments = Arc::new(PaymentAllocationEngine::new(
            dispatcher.clone(),
            collaborators.gateway,
            retries,
        ));

        Self {
            orders: OrderLedgerService::new(
                dispatcher.clone(),
                collaborators.shipments,
                collaborators.notifier.clone(),
                retries,
            ),
            invoices: InvoiceAggregator::new(
                dispatcher.clone(),
                collaborators.discounts,
                config.invoice_due_days,
                retries,
            ),
            reconciler: WebhookReconciler::new(
                payments.clone(),
                collaborators.webhook_logs,
                WebhookSecrets {
                    payos: config.payos_secret.clone(),
                    sepay: config.sepay_secret.clone(),
                },
                config.webhook_claim_lease(),
            ),
            workflows: ReviewWorkflows::new(
                dispatcher.clone(),
                payments.clone(),
                collaborators.notifier.clone(),
                retries,
            ),
            payments,
            dispatcher,
        }
    }
}

pub(crate) fn load_order<S: EventStore, B: EnvelopeBus>(
    dispatcher: &CommandDispatcher<S, B>,
    order_id: OrderId,
) -> Result<Rehydrated<Order>, DispatchError> {
    let loaded = dispatcher.load(order_id.0, ORDER_STREAM, |id| Order::empty(OrderId::new(id)))?;
    if !loaded.aggregate.is_created() {
        return Err(DomainError::not_found().into());
    }
    Ok(loaded)
}

pub(crate) fn load_invoice<S: EventStore, B: EnvelopeBus>(
    dispatcher: &CommandDispatcher<S, B>,
    invoice_id: InvoiceId,
) -> Result<Rehydrated<Invoice>, DispatchError> {
    let loaded = dispatcher.load(invoice_id.0, INVOICE_STREAM, |id| {
        Invoice::empty(InvoiceId::new(id))
    })?;
    if !loaded.aggregate.is_created() {
        return Err(DomainError::not_found().into());
    }
    Ok(loaded)
}

pub(crate) fn load_request<S: EventStore, B: EnvelopeBus>(
    dispatcher: &CommandDispatcher<S, B>,
    request_id: RequestId,
) -> Result<Rehydrated<ReviewRequest>, DispatchError> {
    let loaded = dispatcher.load(request_id.0, REQUEST_STREAM, |id| {
        ReviewRequest::empty(RequestId::new(id))
    })?;
    if !loaded.aggregate.is_created() {
        return Err(DomainError::not_found().into());
    }
    Ok(loaded)
}

pub(crate) fn all_orders<S: EventStore, B: EnvelopeBus>(
    dispatcher: &CommandDispatcher<S, B>,
) -> Result<Vec<Rehydrated<Order>>, DispatchError> {
    dispatcher.load_all(ORDER_STREAM, |id| Order::empty(OrderId::new(id)))
}

pub(crate) fn all_invoices<S: EventStore, B: EnvelopeBus>(
    dispatcher: &CommandDispatcher<S, B>,
) -> Result<Vec<Rehydrated<Invoice>>, DispatchError> {
    dispatcher.load_all(INVOICE_STREAM, |id| Invoice::empty(InvoiceId::new(id)))
}

/// The resource owner, or anyone holding `staff_permission`.
pub(crate) fn ensure_owner_or(
    principal: &Principal,
    owner: Option<UserId>,
    staff_permission: &Permission,
) -> Result<(), AuthzError> {
    if authorize(principal, staff_permission).is_ok() {
        return Ok(());
    }
    match owner {
        Some(owner) => require_owner(principal, owner),
        None => Err(AuthzError::NotOwner {
            actor: principal.user_id,
        }),
    }
}
