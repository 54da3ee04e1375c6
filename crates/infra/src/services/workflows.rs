//! Refund, cancellation and reprint review workflows.
//!
//! A submission places the order (or line) under review and records the
//! request in one commit; the snapshot stored on the order and the previous
//! status stored on the request are taken from the same loaded state. A
//! review records the decision and applies its effect, again in one commit.

use std::sync::Arc;

use chrono::Utc;

use podledger_auth::{Permission, Principal, authorize, require_owner};
use podledger_core::{AggregateId, DomainError, LedgerEntryId, LineId, UserId};
use podledger_invoicing::InvoiceId;
use podledger_orders::{
    Order, OrderCommand, OrderId, PlaceUnderReview, RecordRefund, ReprintResolution,
    RequestReprint, ResolveReprint, ResolveReview, ReviewResolution, Workflow,
};
use podledger_requests::{
    Decision, RecordDecision, RequestCommand, RequestDetails, RequestId, RequestKind,
    ReviewRequest, SubmitRequest,
};

use super::payments::PaymentAllocationEngine;
use super::{EnvelopeBus, ensure_owner_or, load_order, load_request};
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::external::{Notification, NotificationService};
use crate::retry::with_retries;
use crate::streams::REQUEST_STREAM;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRefund {
    pub order_id: OrderId,
    pub amount: u64,
    pub reason: String,
    pub proof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReprint {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub reason: String,
    pub proof: Option<String>,
}

pub struct ReviewWorkflows<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    payments: Arc<PaymentAllocationEngine<S, B>>,
    notifier: Arc<dyn NotificationService>,
    max_retries: u32,
}

impl<S, B> ReviewWorkflows<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        payments: Arc<PaymentAllocationEngine<S, B>>,
        notifier: Arc<dyn NotificationService>,
        max_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            payments,
            notifier,
            max_retries,
        }
    }

    /// Put the order into `Refund` provisionally and open a refund request.
    #[tracing::instrument(skip_all, fields(order_id = %refund.order_id, amount = refund.amount))]
    pub fn submit_refund(
        &self,
        principal: &Principal,
        refund: NewRefund,
    ) -> Result<ReviewRequest, DispatchError> {
        self.submit(principal, refund.order_id, "requests.submit_refund", |order, request_id| {
            let refundable = order.refundable_amount();
            if refund.amount > refundable {
                return Err(DomainError::AmountExceedsBalance {
                    amount: refund.amount,
                    balance: refundable,
                });
            }
            Ok((
                OrderCommand::PlaceUnderReview(PlaceUnderReview {
                    order_id: refund.order_id,
                    request_id,
                    workflow: Workflow::Refund,
                    actor: principal.user_id,
                    occurred_at: Utc::now(),
                }),
                RequestDetails::Refund {
                    order_id: refund.order_id,
                    amount: refund.amount,
                    previous_status: order.status(),
                },
                refund.reason.clone(),
                refund.proof.clone(),
            ))
        })
    }

    /// Hold the order and open a cancellation request.
    #[tracing::instrument(skip_all, fields(order_id = %order_id))]
    pub fn submit_cancellation(
        &self,
        principal: &Principal,
        order_id: OrderId,
        reason: String,
        proof: Option<String>,
    ) -> Result<ReviewRequest, DispatchError> {
        self.submit(principal, order_id, "requests.submit_cancellation", |order, request_id| {
            Ok((
                OrderCommand::PlaceUnderReview(PlaceUnderReview {
                    order_id,
                    request_id,
                    workflow: Workflow::Cancellation,
                    actor: principal.user_id,
                    occurred_at: Utc::now(),
                }),
                RequestDetails::Cancellation {
                    order_id,
                    previous_status: order.status(),
                },
                reason.clone(),
                proof.clone(),
            ))
        })
    }

    /// Mark a line `ReprintRequested` and open a reprint request.
    #[tracing::instrument(skip_all, fields(order_id = %reprint.order_id, line_id = %reprint.line_id))]
    pub fn submit_reprint(
        &self,
        principal: &Principal,
        reprint: NewReprint,
    ) -> Result<ReviewRequest, DispatchError> {
        self.submit(principal, reprint.order_id, "requests.submit_reprint", |order, request_id| {
            let line = order.line(reprint.line_id).ok_or_else(|| {
                DomainError::validation(format!("unknown line {}", reprint.line_id))
            })?;
            Ok((
                OrderCommand::RequestReprint(RequestReprint {
                    order_id: reprint.order_id,
                    line_id: reprint.line_id,
                    request_id,
                    actor: principal.user_id,
                    occurred_at: Utc::now(),
                }),
                RequestDetails::Reprint {
                    order_id: reprint.order_id,
                    line_id: reprint.line_id,
                    previous_line_status: line.status,
                },
                reprint.reason.clone(),
                reprint.proof.clone(),
            ))
        })
    }

    /// Approve or reject a pending request and apply the outcome to the order
    /// (and, for approved refunds, the invoice the order is billed on). The
    /// requester is notified.
    #[tracing::instrument(skip_all, fields(request_id = %request_id))]
    pub fn review(
        &self,
        principal: &Principal,
        request_id: RequestId,
        decision: Decision,
    ) -> Result<ReviewRequest, DispatchError> {
        authorize(principal, &Permission::REQUESTS_REVIEW)?;

        let (request, order_code) = with_retries("requests.review", self.max_retries, |_| {
            self.decide(principal.user_id, request_id, &decision)
        })?;

        tracing::info!(
            kind = ?request.kind(),
            status = ?request.status(),
            "request reviewed"
        );
        self.notify_requester(&request, &order_code);
        Ok(request)
    }

    pub fn get_request(
        &self,
        principal: &Principal,
        request_id: RequestId,
    ) -> Result<ReviewRequest, DispatchError> {
        let request = load_request(&self.dispatcher, request_id)?.aggregate;
        ensure_owner_or(principal, request.requester(), &Permission::ORDERS_TRANSITION)?;
        Ok(request)
    }

    /// Every request ever opened against an order, oldest first.
    pub fn list_requests(
        &self,
        principal: &Principal,
        order_id: OrderId,
    ) -> Result<Vec<ReviewRequest>, DispatchError> {
        let order = load_order(&self.dispatcher, order_id)?.aggregate;
        ensure_owner_or(principal, order.seller_id(), &Permission::ORDERS_TRANSITION)?;

        Ok(self
            .dispatcher
            .load_all(REQUEST_STREAM, |id| ReviewRequest::empty(RequestId::new(id)))?
            .into_iter()
            .map(|r| r.aggregate)
            .filter(|r| r.order_id() == Some(order_id))
            .collect())
    }

    fn submit(
        &self,
        principal: &Principal,
        order_id: OrderId,
        operation: &str,
        prepare: impl Fn(
            &Order,
            AggregateId,
        ) -> Result<(OrderCommand, RequestDetails, String, Option<String>), DomainError>,
    ) -> Result<ReviewRequest, DispatchError> {
        authorize(principal, &Permission::REQUESTS_SUBMIT)?;

        let request = with_retries(operation, self.max_retries, |_| {
            let mut order = load_order(&self.dispatcher, order_id)?;
            let seller = order
                .aggregate
                .seller_id()
                .ok_or_else(|| DomainError::invariant("order has no seller"))?;
            require_owner(principal, seller)?;

            let request_id = RequestId::new(AggregateId::new());
            let (order_command, details, reason, proof) =
                prepare(&order.aggregate, request_id.0)?;

            let mut request = self.dispatcher.load(request_id.0, REQUEST_STREAM, |id| {
                ReviewRequest::empty(RequestId::new(id))
            })?;

            let mut uow = UnitOfWork::new();
            uow.stage(&mut order, order_command)?;
            uow.stage(
                &mut request,
                RequestCommand::SubmitRequest(SubmitRequest {
                    request_id,
                    details,
                    reason,
                    proof,
                    requester: principal.user_id,
                    occurred_at: Utc::now(),
                }),
            )?;
            self.dispatcher.commit(uow)?;
            Ok(request.aggregate)
        })?;

        tracing::info!(kind = ?request.kind(), "request submitted");
        Ok(request)
    }

    fn decide(
        &self,
        reviewer: UserId,
        request_id: RequestId,
        decision: &Decision,
    ) -> Result<(ReviewRequest, String), DispatchError> {
        let now = Utc::now();
        let mut request = load_request(&self.dispatcher, request_id)?;
        let details = request
            .aggregate
            .details()
            .cloned()
            .ok_or_else(DomainError::not_found)?;
        let order_id = details.order_id();
        let mut order = load_order(&self.dispatcher, order_id)?;
        let approved = matches!(decision, Decision::Approved);

        let mut uow = UnitOfWork::new();
        uow.stage(
            &mut request,
            RequestCommand::RecordDecision(RecordDecision {
                request_id,
                decision: decision.clone(),
                reviewer,
                occurred_at: now,
            }),
        )?;

        match details {
            RequestDetails::Cancellation { .. } => {
                uow.stage(
                    &mut order,
                    OrderCommand::ResolveReview(ResolveReview {
                        order_id,
                        request_id: request_id.0,
                        resolution: if approved {
                            ReviewResolution::Finalize
                        } else {
                            ReviewResolution::Restore
                        },
                        actor: reviewer,
                        occurred_at: now,
                    }),
                )?;
            }
            RequestDetails::Refund { amount, .. } if approved => {
                let invoice_id = order.aggregate.invoice_id();
                uow.stage(
                    &mut order,
                    OrderCommand::RecordRefund(RecordRefund {
                        order_id,
                        request_id: request_id.0,
                        entry_id: LedgerEntryId::new(),
                        amount,
                        actor: reviewer,
                        occurred_at: now,
                    }),
                )?;
                if let Some(invoice_id) = invoice_id {
                    self.payments.post_refund(
                        &mut uow,
                        InvoiceId::new(invoice_id),
                        order_id,
                        amount,
                        request_id.0,
                    )?;
                }
            }
            RequestDetails::Refund { .. } => {
                uow.stage(
                    &mut order,
                    OrderCommand::ResolveReview(ResolveReview {
                        order_id,
                        request_id: request_id.0,
                        resolution: ReviewResolution::Restore,
                        actor: reviewer,
                        occurred_at: now,
                    }),
                )?;
            }
            RequestDetails::Reprint { line_id, .. } => {
                uow.stage(
                    &mut order,
                    OrderCommand::ResolveReprint(ResolveReprint {
                        order_id,
                        line_id,
                        request_id: request_id.0,
                        resolution: if approved {
                            ReprintResolution::Approve {
                                new_line_id: LineId::new(),
                            }
                        } else {
                            ReprintResolution::Reject
                        },
                        actor: reviewer,
                        occurred_at: now,
                    }),
                )?;
            }
        }

        self.dispatcher.commit(uow)?;
        Ok((request.aggregate, order.aggregate.code().to_string()))
    }

    fn notify_requester(&self, request: &ReviewRequest, order_code: &str) {
        let Some(requester) = request.requester() else {
            return;
        };
        let kind = match request.kind() {
            Some(RequestKind::Refund) => "refund",
            Some(RequestKind::Cancellation) => "cancellation",
            Some(RequestKind::Reprint) => "reprint",
            None => "review",
        };
        let message = match request.rejection_reason() {
            Some(reason) => {
                format!("Your {kind} request for order {order_code} was rejected: {reason}")
            }
            None => format!("Your {kind} request for order {order_code} was approved"),
        };

        let result = self.notifier.notify(Notification {
            user_id: requester,
            message,
            redirect_url: format!("/requests/{}", request.id_typed()),
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to notify requester");
        }
    }
}
