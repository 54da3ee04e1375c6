//! Invoice aggregation over shipped orders.
//!
//! Eligibility is decided against freshly loaded order streams, and the
//! invoice plus every order's invoice link are committed in one batch whose
//! expected versions are the versions the orders were read at. Two
//! overlapping creations therefore cannot both win; the loser retries
//! against fresh state and finds the orders already taken.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use podledger_auth::{Permission, Principal, authorize};
use podledger_core::{AggregateId, DomainError, UserId};
use podledger_invoicing::{
    AppliedDiscount, CancelInvoice, Invoice, InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceItem,
    IssueInvoice, invoice_number,
};
use podledger_orders::{
    MarkInvoiced, Order, OrderCommand, OrderId, ReleaseFromInvoice,
};

use super::{EnvelopeBus, all_invoices, all_orders, ensure_owner_or, load_invoice, load_order};
use crate::command_dispatcher::{CommandDispatcher, DispatchError, Rehydrated};
use crate::event_store::EventStore;
use crate::external::DiscountValidator;
use crate::retry::with_retries;
use crate::streams::INVOICE_STREAM;
use crate::unit_of_work::UnitOfWork;

/// Which orders an ad-hoc invoice should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderSelection {
    OrderIds(Vec<OrderId>),
    /// Orders shipped in `[from, to)`.
    DateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl OrderSelection {
    fn includes(&self, order: &Order) -> bool {
        match self {
            OrderSelection::OrderIds(ids) => ids.contains(&order.id_typed()),
            OrderSelection::DateRange { from, to } => order
                .shipped_at()
                .is_some_and(|at| at >= *from && at < *to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdHocInvoice {
    pub seller_id: UserId,
    pub selection: OrderSelection,
    pub notes: Option<String>,
    pub discount_code: Option<String>,
}

pub struct InvoiceAggregator<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    discounts: Arc<dyn DiscountValidator>,
    due_days: i64,
    max_retries: u32,
}

impl<S, B> InvoiceAggregator<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        discounts: Arc<dyn DiscountValidator>,
        due_days: i64,
        max_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            discounts,
            due_days,
            max_retries,
        }
    }

    #[tracing::instrument(skip_all, fields(seller_id = %request.seller_id))]
    pub fn create_ad_hoc_invoice(
        &self,
        principal: &Principal,
        request: AdHocInvoice,
    ) -> Result<Invoice, DispatchError> {
        authorize(principal, &Permission::INVOICES_CREATE)?;
        if let OrderSelection::DateRange { from, to } = &request.selection {
            if from >= to {
                return Err(DomainError::validation("date range is empty").into());
            }
        }

        with_retries("invoices.create", self.max_retries, |_| {
            self.issue(principal, &request)
        })
    }

    /// Invoice every eligible order the seller shipped in the calendar month.
    /// Calling it again without new shipments fails with `NothingToInvoice`.
    #[tracing::instrument(skip_all, fields(seller_id = %seller_id, year, month))]
    pub fn create_monthly_invoice(
        &self,
        principal: &Principal,
        seller_id: UserId,
        year: i32,
        month: u32,
    ) -> Result<Invoice, DispatchError> {
        let (from, to) = month_bounds(year, month)?;
        let request = AdHocInvoice {
            seller_id,
            selection: OrderSelection::DateRange { from, to },
            notes: Some(format!("Monthly invoice {year}-{month:02}")),
            discount_code: None,
        };

        match self.create_ad_hoc_invoice(principal, request) {
            Err(DispatchError::Domain(DomainError::NoEligibleOrders)) => {
                Err(DomainError::NothingToInvoice.into())
            }
            other => other,
        }
    }

    /// Cancel an invoice with no completed payments and release its orders
    /// in the same commit.
    #[tracing::instrument(skip_all, fields(invoice_id = %invoice_id))]
    pub fn cancel_invoice(
        &self,
        principal: &Principal,
        invoice_id: InvoiceId,
        reason: String,
    ) -> Result<Invoice, DispatchError> {
        authorize(principal, &Permission::INVOICES_CANCEL)?;
        let actor = principal.user_id;

        let invoice = with_retries("invoices.cancel", self.max_retries, |_| {
            let now = Utc::now();
            let mut invoice = load_invoice(&self.dispatcher, invoice_id)?;
            let mut uow = UnitOfWork::new();

            let events = uow.stage(
                &mut invoice,
                InvoiceCommand::CancelInvoice(CancelInvoice {
                    invoice_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: now,
                }),
            )?;

            let released = events.iter().flat_map(|e| match e {
                InvoiceEvent::InvoiceCancelled(c) => c.released_orders.clone(),
                _ => vec![],
            });
            for order_id in released {
                let mut order = load_order(&self.dispatcher, order_id)?;
                uow.stage(
                    &mut order,
                    OrderCommand::ReleaseFromInvoice(ReleaseFromInvoice {
                        order_id,
                        invoice_id: invoice_id.0,
                        occurred_at: now,
                    }),
                )?;
            }

            self.dispatcher.commit(uow)?;
            Ok(invoice.aggregate)
        })?;

        tracing::info!(number = invoice.number(), "invoice cancelled");
        Ok(invoice)
    }

    pub fn get_invoice(
        &self,
        principal: &Principal,
        invoice_id: InvoiceId,
    ) -> Result<Invoice, DispatchError> {
        let invoice = load_invoice(&self.dispatcher, invoice_id)?.aggregate;
        ensure_owner_or(principal, invoice.seller_id(), &Permission::INVOICES_CREATE)?;
        Ok(invoice)
    }

    /// Invoices of one seller, oldest first.
    pub fn list_invoices(
        &self,
        principal: &Principal,
        seller_id: UserId,
    ) -> Result<Vec<Invoice>, DispatchError> {
        ensure_owner_or(principal, Some(seller_id), &Permission::INVOICES_CREATE)?;
        Ok(all_invoices(&self.dispatcher)?
            .into_iter()
            .map(|r| r.aggregate)
            .filter(|i| i.seller_id() == Some(seller_id))
            .collect())
    }

    fn issue(&self, principal: &Principal, request: &AdHocInvoice) -> Result<Invoice, DispatchError> {
        let now = Utc::now();
        let mut orders = self.eligible_orders(request)?;
        if orders.is_empty() {
            return Err(DomainError::NoEligibleOrders.into());
        }

        let items: Vec<InvoiceItem> = orders
            .iter()
            .map(|o| InvoiceItem {
                order_id: o.aggregate.id_typed(),
                order_code: o.aggregate.code().to_string(),
                amount: o.aggregate.refundable_amount(),
            })
            .collect();
        let total = items
            .iter()
            .try_fold(0u64, |acc, i| acc.checked_add(i.amount))
            .ok_or_else(|| DomainError::invariant("invoice total overflow"))?;

        let discount = match request.discount_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(AppliedDiscount {
                code: code.to_uppercase(),
                amount: self.discounts.validate(code, total, now)?,
            }),
            _ => None,
        };

        let invoice_id = InvoiceId::new(AggregateId::new());
        let mut invoice = self.dispatcher.load(invoice_id.0, INVOICE_STREAM, |id| {
            Invoice::empty(InvoiceId::new(id))
        })?;

        let mut uow = UnitOfWork::new();
        uow.stage(
            &mut invoice,
            InvoiceCommand::IssueInvoice(IssueInvoice {
                invoice_id,
                number: invoice_number(invoice_id, now),
                seller_id: request.seller_id,
                items,
                discount,
                due_date: now + Duration::days(self.due_days),
                notes: request.notes.clone(),
                actor: principal.user_id,
                occurred_at: now,
            }),
        )?;
        for order in &mut orders {
            let order_id = order.aggregate.id_typed();
            uow.stage(
                order,
                OrderCommand::MarkInvoiced(MarkInvoiced {
                    order_id,
                    invoice_id: invoice_id.0,
                    occurred_at: now,
                }),
            )?;
        }

        self.dispatcher.commit(uow)?;

        let invoice = invoice.aggregate;
        tracing::info!(
            number = invoice.number(),
            orders = invoice.items().len(),
            payable = invoice.payable_amount(),
            "invoice created"
        );
        Ok(invoice)
    }

    fn eligible_orders(
        &self,
        request: &AdHocInvoice,
    ) -> Result<Vec<Rehydrated<Order>>, DispatchError> {
        let mut eligible = Vec::new();
        for loaded in all_orders(&self.dispatcher)? {
            let order = &loaded.aggregate;
            if order.seller_id() != Some(request.seller_id) || !request.selection.includes(order) {
                continue;
            }
            if !order.is_invoice_eligible() {
                tracing::debug!(
                    order = order.code(),
                    status = ?order.status(),
                    invoiced = order.invoice_id().is_some(),
                    "skipping order not eligible for invoicing"
                );
                continue;
            }
            eligible.push(loaded);
        }
        Ok(eligible)
    }
}

/// `[first instant of month, first instant of next month)` in UTC.
pub fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>), DomainError> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| DomainError::validation(format!("invalid month {year}-{month}")))?;
    let next = if start.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| DomainError::validation(format!("invalid month {year}-{month}")))?;

    let to_utc = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .ok_or_else(|| DomainError::validation("invalid date"))
    };
    Ok((to_utc(start)?, to_utc(next)?))
}
