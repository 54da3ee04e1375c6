use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::{Aggregate, AggregateId, AggregateRoot, DomainError, PaymentId, UserId};
use podledger_events::Event;
use podledger_orders::OrderId;

use crate::payment::{Payment, PaymentKind, PaymentMethod, PaymentStatus};

/// Invoice identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Human-facing invoice number: `INV-YYYYMM-XXXXXXXX`.
///
/// The suffix is taken from the random tail of the invoice id.
pub fn invoice_number(invoice_id: InvoiceId, issued_at: DateTime<Utc>) -> String {
    let simple = invoice_id.0.as_uuid().simple().to_string();
    let suffix = &simple[simple.len() - 8..];
    format!(
        "INV-{}-{}",
        issued_at.format("%Y%m"),
        suffix.to_ascii_uppercase()
    )
}

/// Invoice payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    /// Status for a given paid amount against the payable amount.
    pub fn derive(amount_paid: u64, payable: u64) -> Self {
        if amount_paid >= payable {
            InvoiceStatus::Paid
        } else if amount_paid == 0 {
            InvoiceStatus::Unpaid
        } else {
            InvoiceStatus::Partial
        }
    }
}

/// Invoice ↔ order link with the order total snapshotted at invoicing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub order_id: OrderId,
    pub order_code: String,
    pub amount: u64,
}

/// Approved refund credited against one order on the invoice. Credits lower
/// the payable amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCredit {
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub amount: u64,
    pub credited_at: DateTime<Utc>,
}

/// Discount resolved by the caller before issuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub code: String,
    pub amount: u64,
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    number: String,
    seller_id: Option<UserId>,
    items: Vec<InvoiceItem>,
    total_amount: u64,
    discount_amount: u64,
    discount_code: Option<String>,
    credits: Vec<RefundCredit>,
    credited_amount: u64,
    amount_paid: u64,
    status: InvoiceStatus,
    due_date: Option<DateTime<Utc>>,
    notes: Option<String>,
    payments: Vec<Payment>,
    issued_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            number: String::new(),
            seller_id: None,
            items: Vec::new(),
            total_amount: 0,
            discount_amount: 0,
            discount_code: None,
            credits: Vec::new(),
            credited_amount: 0,
            amount_paid: 0,
            status: InvoiceStatus::Unpaid,
            due_date: None,
            notes: None,
            payments: Vec::new(),
            issued_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn seller_id(&self) -> Option<UserId> {
        self.seller_id
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    pub fn contains_order(&self, order_id: OrderId) -> bool {
        self.items.iter().any(|i| i.order_id == order_id)
    }

    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn discount_amount(&self) -> u64 {
        self.discount_amount
    }

    pub fn discount_code(&self) -> Option<&str> {
        self.discount_code.as_deref()
    }

    /// Total after discount and refund credits.
    pub fn payable_amount(&self) -> u64 {
        self.total_amount
            .saturating_sub(self.discount_amount)
            .saturating_sub(self.credited_amount)
    }

    pub fn credited_amount(&self) -> u64 {
        self.credited_amount
    }

    pub fn credits(&self) -> &[RefundCredit] {
        &self.credits
    }

    /// Sum of refund credits already granted for one order.
    pub fn credited_for(&self, order_id: OrderId) -> u64 {
        self.credits
            .iter()
            .filter(|c| c.order_id == order_id)
            .map(|c| c.amount)
            .sum()
    }

    pub fn amount_paid(&self) -> u64 {
        self.amount_paid
    }

    pub fn outstanding_amount(&self) -> u64 {
        self.payable_amount().saturating_sub(self.amount_paid)
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn payment_by_reference(&self, reference: &str) -> Option<&Payment> {
        self.payments.iter().find(|p| p.has_reference(reference))
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: IssueInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInvoice {
    pub invoice_id: InvoiceId,
    pub number: String,
    pub seller_id: UserId,
    pub items: Vec<InvoiceItem>,
    pub discount: Option<AppliedDiscount>,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: InitiatePayment. Records a Pending payment awaiting gateway
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatePayment {
    pub invoice_id: InvoiceId,
    pub payment_id: PaymentId,
    pub amount: u64,
    pub method: PaymentMethod,
    pub gateway_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordPayment. A completed charge (manual entry or bank transfer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub invoice_id: InvoiceId,
    pub payment_id: PaymentId,
    pub amount: u64,
    pub method: PaymentMethod,
    pub gateway_reference: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompletePayment. Confirms a Pending payment by gateway reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayment {
    pub invoice_id: InvoiceId,
    pub gateway_reference: String,
    /// Amount the gateway reports as settled.
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailPayment {
    pub invoice_id: InvoiceId,
    pub gateway_reference: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordRefund. Credits an approved refund for one order; whatever
/// the seller already paid beyond the reduced payable goes back as a
/// negative payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRefund {
    pub invoice_id: InvoiceId,
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    IssueInvoice(IssueInvoice),
    InitiatePayment(InitiatePayment),
    RecordPayment(RecordPayment),
    CompletePayment(CompletePayment),
    FailPayment(FailPayment),
    RecordRefund(RecordRefund),
    CancelInvoice(CancelInvoice),
}

/// Event: InvoiceIssued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub invoice_id: InvoiceId,
    pub number: String,
    pub seller_id: UserId,
    pub items: Vec<InvoiceItem>,
    pub total_amount: u64,
    pub discount: Option<AppliedDiscount>,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentInitiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiated {
    pub invoice_id: InvoiceId,
    pub payment: Payment,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentRecorded. A completed charge was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecorded {
    pub invoice_id: InvoiceId,
    pub payment: Payment,
    pub new_amount_paid: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentCompleted. A pending payment settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub invoice_id: InvoiceId,
    pub payment_id: PaymentId,
    pub amount: u64,
    pub new_amount_paid: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub invoice_id: InvoiceId,
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundCredited. The payable amount dropped by `credit.amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCredited {
    pub invoice_id: InvoiceId,
    pub credit: RefundCredit,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundPosted. Money returned to the seller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPosted {
    pub invoice_id: InvoiceId,
    pub payment: Payment,
    pub new_amount_paid: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub released_orders: Vec<OrderId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceIssued(InvoiceIssued),
    PaymentInitiated(PaymentInitiated),
    PaymentRecorded(PaymentRecorded),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    RefundCredited(RefundCredited),
    RefundPosted(RefundPosted),
    InvoiceCancelled(InvoiceCancelled),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceIssued(_) => "invoicing.invoice.issued",
            InvoiceEvent::PaymentInitiated(_) => "invoicing.invoice.payment_initiated",
            InvoiceEvent::PaymentRecorded(_) => "invoicing.invoice.payment_recorded",
            InvoiceEvent::PaymentCompleted(_) => "invoicing.invoice.payment_completed",
            InvoiceEvent::PaymentFailed(_) => "invoicing.invoice.payment_failed",
            InvoiceEvent::RefundCredited(_) => "invoicing.invoice.refund_credited",
            InvoiceEvent::RefundPosted(_) => "invoicing.invoice.refund_posted",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceIssued(e) => e.occurred_at,
            InvoiceEvent::PaymentInitiated(e) => e.occurred_at,
            InvoiceEvent::PaymentRecorded(e) => e.occurred_at,
            InvoiceEvent::PaymentCompleted(e) => e.occurred_at,
            InvoiceEvent::PaymentFailed(e) => e.occurred_at,
            InvoiceEvent::RefundCredited(e) => e.occurred_at,
            InvoiceEvent::RefundPosted(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceIssued(e) => {
                self.id = e.invoice_id;
                self.number = e.number.clone();
                self.seller_id = Some(e.seller_id);
                self.items = e.items.clone();
                self.total_amount = e.total_amount;
                self.discount_amount = e.discount.as_ref().map_or(0, |d| d.amount);
                self.discount_code = e.discount.as_ref().map(|d| d.code.clone());
                self.amount_paid = 0;
                self.due_date = Some(e.due_date);
                self.notes = e.notes.clone();
                self.issued_at = Some(e.occurred_at);
                self.status = InvoiceStatus::derive(0, self.payable_amount());
                self.created = true;
            }
            InvoiceEvent::PaymentInitiated(e) => {
                self.payments.push(e.payment.clone());
            }
            InvoiceEvent::PaymentRecorded(e) => {
                self.payments.push(e.payment.clone());
                self.set_amount_paid(e.new_amount_paid);
            }
            InvoiceEvent::PaymentCompleted(e) => {
                if let Some(p) = self.payment_mut(e.payment_id) {
                    p.status = PaymentStatus::Completed;
                    p.amount = e.amount;
                    p.settled_at = Some(e.occurred_at);
                }
                self.set_amount_paid(e.new_amount_paid);
            }
            InvoiceEvent::PaymentFailed(e) => {
                if let Some(p) = self.payment_mut(e.payment_id) {
                    p.status = PaymentStatus::Failed;
                    p.settled_at = Some(e.occurred_at);
                }
            }
            InvoiceEvent::RefundCredited(e) => {
                self.credited_amount += e.credit.amount;
                self.credits.push(e.credit.clone());
                self.set_amount_paid(self.amount_paid);
            }
            InvoiceEvent::RefundPosted(e) => {
                self.payments.push(e.payment.clone());
                self.set_amount_paid(e.new_amount_paid);
            }
            InvoiceEvent::InvoiceCancelled(e) => {
                for p in self.payments.iter_mut().filter(|p| p.is_pending()) {
                    p.status = PaymentStatus::Failed;
                    p.settled_at = Some(e.occurred_at);
                }
                self.cancel_reason = Some(e.reason.clone());
                self.status = InvoiceStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::IssueInvoice(cmd) => self.handle_issue(cmd),
            InvoiceCommand::InitiatePayment(cmd) => self.handle_initiate_payment(cmd),
            InvoiceCommand::RecordPayment(cmd) => self.handle_record_payment(cmd),
            InvoiceCommand::CompletePayment(cmd) => self.handle_complete_payment(cmd),
            InvoiceCommand::FailPayment(cmd) => self.handle_fail_payment(cmd),
            InvoiceCommand::RecordRefund(cmd) => self.handle_record_refund(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Invoice {
    fn payment_mut(&mut self, payment_id: PaymentId) -> Option<&mut Payment> {
        self.payments.iter_mut().find(|p| p.payment_id == payment_id)
    }

    fn set_amount_paid(&mut self, amount_paid: u64) {
        self.amount_paid = amount_paid;
        if self.status != InvoiceStatus::Cancelled {
            self.status = InvoiceStatus::derive(amount_paid, self.payable_amount());
        }
    }

    fn ensure_invoice_id(&self, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    fn ensure_open(&self, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_invoice_id(invoice_id)?;
        if self.is_cancelled() {
            return Err(DomainError::conflict(format!(
                "invoice {} is cancelled",
                self.number
            )));
        }
        Ok(())
    }

    /// Reject charges that would push `amount_paid` past the payable amount.
    fn ensure_within_balance(&self, amount: u64) -> Result<u64, DomainError> {
        if amount == 0 {
            return Err(DomainError::validation("payment amount must be positive"));
        }
        let balance = self.outstanding_amount();
        if amount > balance {
            return Err(DomainError::AmountExceedsBalance { amount, balance });
        }
        Ok(self.amount_paid + amount)
    }

    fn handle_issue(&self, cmd: &IssueInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }

        if cmd.items.is_empty() {
            return Err(DomainError::NoEligibleOrders);
        }

        let mut total: u64 = 0;
        for (idx, item) in cmd.items.iter().enumerate() {
            if cmd.items[..idx].iter().any(|i| i.order_id == item.order_id) {
                return Err(DomainError::validation(format!(
                    "order {} listed twice",
                    item.order_code
                )));
            }
            total = total
                .checked_add(item.amount)
                .ok_or_else(|| DomainError::invariant("invoice total overflow"))?;
        }

        if let Some(discount) = &cmd.discount {
            if discount.amount > total {
                return Err(DomainError::InvalidDiscount(format!(
                    "discount {} exceeds invoice total",
                    discount.code
                )));
            }
        }

        Ok(vec![InvoiceEvent::InvoiceIssued(InvoiceIssued {
            invoice_id: cmd.invoice_id,
            number: cmd.number.clone(),
            seller_id: cmd.seller_id,
            items: cmd.items.clone(),
            total_amount: total,
            discount: cmd.discount.clone(),
            due_date: cmd.due_date,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_initiate_payment(
        &self,
        cmd: &InitiatePayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_open(cmd.invoice_id)?;
        self.ensure_within_balance(cmd.amount)?;

        if self.payment_by_reference(&cmd.gateway_reference).is_some() {
            return Err(DomainError::conflict(format!(
                "gateway reference {} already used",
                cmd.gateway_reference
            )));
        }

        Ok(vec![InvoiceEvent::PaymentInitiated(PaymentInitiated {
            invoice_id: cmd.invoice_id,
            payment: Payment {
                payment_id: cmd.payment_id,
                amount: cmd.amount,
                kind: PaymentKind::Charge,
                method: cmd.method,
                gateway_reference: Some(cmd.gateway_reference.clone()),
                status: PaymentStatus::Pending,
                order_id: None,
                request_id: None,
                created_at: cmd.occurred_at,
                settled_at: None,
            },
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_payment(&self, cmd: &RecordPayment) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_open(cmd.invoice_id)?;

        if let Some(reference) = &cmd.gateway_reference {
            match self.payment_by_reference(reference) {
                Some(existing) if existing.is_completed() => return Ok(vec![]),
                Some(_) => {
                    return Err(DomainError::conflict(format!(
                        "gateway reference {reference} belongs to an unsettled payment"
                    )));
                }
                None => {}
            }
        }

        let new_amount_paid = self.ensure_within_balance(cmd.amount)?;

        Ok(vec![InvoiceEvent::PaymentRecorded(PaymentRecorded {
            invoice_id: cmd.invoice_id,
            payment: Payment {
                payment_id: cmd.payment_id,
                amount: cmd.amount,
                kind: PaymentKind::Charge,
                method: cmd.method,
                gateway_reference: cmd.gateway_reference.clone(),
                status: PaymentStatus::Completed,
                order_id: None,
                request_id: None,
                created_at: cmd.occurred_at,
                settled_at: Some(cmd.occurred_at),
            },
            new_amount_paid,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete_payment(
        &self,
        cmd: &CompletePayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_invoice_id(cmd.invoice_id)?;

        let payment = self
            .payment_by_reference(&cmd.gateway_reference)
            .ok_or_else(DomainError::not_found)?;

        match payment.status {
            PaymentStatus::Completed => return Ok(vec![]),
            PaymentStatus::Failed => {
                return Err(DomainError::conflict(format!(
                    "payment {} already failed",
                    cmd.gateway_reference
                )));
            }
            PaymentStatus::Pending => {}
        }

        self.ensure_open(cmd.invoice_id)?;
        let new_amount_paid = self.ensure_within_balance(cmd.amount)?;

        Ok(vec![InvoiceEvent::PaymentCompleted(PaymentCompleted {
            invoice_id: cmd.invoice_id,
            payment_id: payment.payment_id,
            amount: cmd.amount,
            new_amount_paid,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail_payment(&self, cmd: &FailPayment) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_invoice_id(cmd.invoice_id)?;

        let payment = self
            .payment_by_reference(&cmd.gateway_reference)
            .ok_or_else(DomainError::not_found)?;

        match payment.status {
            PaymentStatus::Failed => Ok(vec![]),
            PaymentStatus::Completed => Err(DomainError::conflict(format!(
                "payment {} already completed",
                cmd.gateway_reference
            ))),
            PaymentStatus::Pending => Ok(vec![InvoiceEvent::PaymentFailed(PaymentFailed {
                invoice_id: cmd.invoice_id,
                payment_id: payment.payment_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_record_refund(&self, cmd: &RecordRefund) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_open(cmd.invoice_id)?;

        let item = self
            .items
            .iter()
            .find(|i| i.order_id == cmd.order_id)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "order {} is not on invoice {}",
                    cmd.order_id, self.number
                ))
            })?;

        if cmd.amount == 0 {
            return Err(DomainError::validation("refund amount must be positive"));
        }

        if self
            .credits
            .iter()
            .any(|c| c.request_id == cmd.request_id)
        {
            return Ok(vec![]);
        }

        let creditable = item.amount.saturating_sub(self.credited_for(cmd.order_id));
        if cmd.amount > creditable {
            return Err(DomainError::AmountExceedsBalance {
                amount: cmd.amount,
                balance: creditable,
            });
        }

        let mut events = vec![InvoiceEvent::RefundCredited(RefundCredited {
            invoice_id: cmd.invoice_id,
            credit: RefundCredit {
                order_id: cmd.order_id,
                request_id: cmd.request_id,
                amount: cmd.amount,
                credited_at: cmd.occurred_at,
            },
            occurred_at: cmd.occurred_at,
        })];

        let reduced_payable = self.payable_amount().saturating_sub(cmd.amount);
        let returned = self.amount_paid.saturating_sub(reduced_payable);
        if returned > 0 {
            events.push(InvoiceEvent::RefundPosted(RefundPosted {
                invoice_id: cmd.invoice_id,
                payment: Payment {
                    payment_id: cmd.payment_id,
                    amount: returned,
                    kind: PaymentKind::Refund,
                    method: PaymentMethod::Manual,
                    gateway_reference: None,
                    status: PaymentStatus::Completed,
                    order_id: Some(cmd.order_id),
                    request_id: Some(cmd.request_id),
                    created_at: cmd.occurred_at,
                    settled_at: Some(cmd.occurred_at),
                },
                new_amount_paid: self.amount_paid - returned,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_open(cmd.invoice_id)?;

        if self.amount_paid > 0 {
            return Err(DomainError::conflict(format!(
                "invoice {} has completed payments",
                self.number
            )));
        }

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            released_orders: self.items.iter().map(|i| i.order_id).collect(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
