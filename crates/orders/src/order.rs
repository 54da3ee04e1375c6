use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, LedgerEntryId, LineId, UserId,
};
use podledger_events::Event;

use crate::status::{LineStatus, OrderStatus, StatusSnapshot, TransitionTable, Workflow};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Order detail line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_id: LineId,
    pub variant_sku: String,
    pub product_name: String,
    pub quantity: u32,
    /// Price in minor currency units.
    pub unit_price: u64,
    pub status: LineStatus,
    pub designer: Option<UserId>,
    /// Set on lines created by an approved reprint.
    pub reprint_of: Option<LineId>,
    pub pending_reprint: Option<StatusSnapshot<LineStatus>>,
}

impl OrderLine {
    pub fn subtotal(&self) -> u64 {
        u64::from(self.quantity).saturating_mul(self.unit_price)
    }
}

/// Line as supplied when creating an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub line_id: LineId,
    pub variant_sku: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: u64,
}

/// Refund ledger entry recorded against the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundEntry {
    pub entry_id: LedgerEntryId,
    pub request_id: AggregateId,
    pub amount: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    seller_id: Option<UserId>,
    code: String,
    customer_ref: String,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    total_cost: u64,
    invoice_id: Option<AggregateId>,
    provisional: Option<StatusSnapshot<OrderStatus>>,
    refunds: Vec<RefundEntry>,
    shipped_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            seller_id: None,
            code: String::new(),
            customer_ref: String::new(),
            status: OrderStatus::Draft,
            lines: Vec::new(),
            total_cost: 0,
            invoice_id: None,
            provisional: None,
            refunds: Vec::new(),
            shipped_at: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn seller_id(&self) -> Option<UserId> {
        self.seller_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn customer_ref(&self) -> &str {
        &self.customer_ref
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn line(&self, line_id: LineId) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.line_id == line_id)
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn invoice_id(&self) -> Option<AggregateId> {
        self.invoice_id
    }

    pub fn provisional(&self) -> Option<&StatusSnapshot<OrderStatus>> {
        self.provisional.as_ref()
    }

    pub fn refunds(&self) -> &[RefundEntry] {
        &self.refunds
    }

    pub fn refunded_amount(&self) -> u64 {
        self.refunds.iter().map(|r| r.amount).sum()
    }

    pub fn refundable_amount(&self) -> u64 {
        self.total_cost.saturating_sub(self.refunded_amount())
    }

    pub fn is_partially_refunded(&self) -> bool {
        let refunded = self.refunded_amount();
        refunded > 0 && refunded < self.total_cost
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// True when a review request currently owns the order status.
    pub fn is_under_review(&self) -> bool {
        self.provisional
            .as_ref()
            .is_some_and(|s| s.request_id.is_some())
    }

    /// Cancelled, or settled in `Refund` with no review pending.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            OrderStatus::Cancelled => true,
            OrderStatus::Refund => self.provisional.is_none(),
            _ => false,
        }
    }

    /// Shipped and not already on an invoice.
    pub fn is_invoice_eligible(&self) -> bool {
        self.created && self.status == OrderStatus::Shipped && self.invoice_id.is_none()
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub seller_id: UserId,
    pub code: String,
    pub customer_ref: String,
    pub lines: Vec<NewLine>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransitionStatus (production table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStatus {
    pub order_id: OrderId,
    pub target: OrderStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseHold (manual holds only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseHold {
    pub order_id: OrderId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: PlaceUnderReview.
///
/// `workflow` selects the table: cancellation holds the order, refund moves
/// it to `Refund`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceUnderReview {
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub workflow: Workflow,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResolution {
    /// Keep the outcome: `Hold` becomes `Cancelled`, `Refund` stays.
    Finalize,
    /// Write the captured snapshot back.
    Restore,
}

/// Command: ResolveReview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReview {
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub resolution: ReviewResolution,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignDesigner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignDesigner {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub designer: UserId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetLineStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLineStatus {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub status: LineStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoiced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoiced {
    pub order_id: OrderId,
    pub invoice_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseFromInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFromInvoice {
    pub order_id: OrderId,
    pub invoice_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordRefund.
///
/// Approves the refund review held by `request_id`: writes the ledger entry
/// and resolves the provisional `Refund` state in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRefund {
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub entry_id: LedgerEntryId,
    pub amount: u64,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RequestReprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReprint {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub request_id: AggregateId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReprintResolution {
    Approve { new_line_id: LineId },
    Reject,
}

/// Command: ResolveReprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReprint {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub request_id: AggregateId,
    pub resolution: ReprintResolution,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    TransitionStatus(TransitionStatus),
    ReleaseHold(ReleaseHold),
    PlaceUnderReview(PlaceUnderReview),
    ResolveReview(ResolveReview),
    AssignDesigner(AssignDesigner),
    SetLineStatus(SetLineStatus),
    MarkInvoiced(MarkInvoiced),
    ReleaseFromInvoice(ReleaseFromInvoice),
    RecordRefund(RecordRefund),
    RequestReprint(RequestReprint),
    ResolveReprint(ResolveReprint),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub seller_id: UserId,
    pub code: String,
    pub customer_ref: String,
    pub lines: Vec<NewLine>,
    pub total_cost: u64,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: HoldPlaced. The order entered a provisional state (`Hold` or
/// `Refund`) with `previous` captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldPlaced {
    pub order_id: OrderId,
    pub previous: OrderStatus,
    pub held_as: OrderStatus,
    pub request_id: Option<AggregateId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: HoldResolved. The provisional snapshot is discarded and the order
/// ends up in `resolved_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldResolved {
    pub order_id: OrderId,
    pub request_id: Option<AggregateId>,
    pub resolved_to: OrderStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DesignerAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignerAssigned {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub designer: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStatusChanged {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub from: LineStatus,
    pub to: LineStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Invoiced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoiced {
    pub order_id: OrderId,
    pub invoice_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceReleased {
    pub order_id: OrderId,
    pub invoice_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecorded {
    pub order_id: OrderId,
    pub request_id: AggregateId,
    pub entry_id: LedgerEntryId,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReprintRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprintRequested {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub request_id: AggregateId,
    pub previous: LineStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReprintResolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprintResolved {
    pub order_id: OrderId,
    pub line_id: LineId,
    pub request_id: AggregateId,
    pub resolution: ReprintResolution,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    StatusChanged(StatusChanged),
    HoldPlaced(HoldPlaced),
    HoldResolved(HoldResolved),
    DesignerAssigned(DesignerAssigned),
    LineStatusChanged(LineStatusChanged),
    Invoiced(Invoiced),
    InvoiceReleased(InvoiceReleased),
    RefundRecorded(RefundRecorded),
    ReprintRequested(ReprintRequested),
    ReprintResolved(ReprintResolved),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "orders.order.created",
            OrderEvent::StatusChanged(_) => "orders.order.status_changed",
            OrderEvent::HoldPlaced(_) => "orders.order.hold_placed",
            OrderEvent::HoldResolved(_) => "orders.order.hold_resolved",
            OrderEvent::DesignerAssigned(_) => "orders.order.designer_assigned",
            OrderEvent::LineStatusChanged(_) => "orders.order.line_status_changed",
            OrderEvent::Invoiced(_) => "orders.order.invoiced",
            OrderEvent::InvoiceReleased(_) => "orders.order.invoice_released",
            OrderEvent::RefundRecorded(_) => "orders.order.refund_recorded",
            OrderEvent::ReprintRequested(_) => "orders.order.reprint_requested",
            OrderEvent::ReprintResolved(_) => "orders.order.reprint_resolved",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::StatusChanged(e) => e.occurred_at,
            OrderEvent::HoldPlaced(e) => e.occurred_at,
            OrderEvent::HoldResolved(e) => e.occurred_at,
            OrderEvent::DesignerAssigned(e) => e.occurred_at,
            OrderEvent::LineStatusChanged(e) => e.occurred_at,
            OrderEvent::Invoiced(e) => e.occurred_at,
            OrderEvent::InvoiceReleased(e) => e.occurred_at,
            OrderEvent::RefundRecorded(e) => e.occurred_at,
            OrderEvent::ReprintRequested(e) => e.occurred_at,
            OrderEvent::ReprintResolved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.seller_id = Some(e.seller_id);
                self.code = e.code.clone();
                self.customer_ref = e.customer_ref.clone();
                self.status = OrderStatus::Draft;
                self.lines = e
                    .lines
                    .iter()
                    .map(|l| OrderLine {
                        line_id: l.line_id,
                        variant_sku: l.variant_sku.clone(),
                        product_name: l.product_name.clone(),
                        quantity: l.quantity,
                        unit_price: l.unit_price,
                        status: LineStatus::Draft,
                        designer: None,
                        reprint_of: None,
                        pending_reprint: None,
                    })
                    .collect();
                self.total_cost = e.total_cost;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::StatusChanged(e) => {
                self.status = e.to;
                if e.to == OrderStatus::Shipped {
                    self.shipped_at = Some(e.occurred_at);
                }
                // Leaving a manual hold for Cancelled drops its snapshot.
                if !e.to.is_provisional() {
                    self.provisional = None;
                }
            }
            OrderEvent::HoldPlaced(e) => {
                self.provisional = Some(StatusSnapshot::capture(
                    e.previous,
                    e.request_id,
                    e.occurred_at,
                ));
                self.status = e.held_as;
            }
            OrderEvent::HoldResolved(e) => {
                self.provisional = None;
                self.status = e.resolved_to;
            }
            OrderEvent::DesignerAssigned(e) => {
                if let Some(line) = self.line_mut(e.line_id) {
                    line.designer = Some(e.designer);
                }
            }
            OrderEvent::LineStatusChanged(e) => {
                if let Some(line) = self.line_mut(e.line_id) {
                    line.status = e.to;
                }
            }
            OrderEvent::Invoiced(e) => {
                self.invoice_id = Some(e.invoice_id);
            }
            OrderEvent::InvoiceReleased(_) => {
                self.invoice_id = None;
            }
            OrderEvent::RefundRecorded(e) => {
                self.refunds.push(RefundEntry {
                    entry_id: e.entry_id,
                    request_id: e.request_id,
                    amount: e.amount,
                    recorded_at: e.occurred_at,
                });
            }
            OrderEvent::ReprintRequested(e) => {
                if let Some(line) = self.line_mut(e.line_id) {
                    line.pending_reprint = Some(StatusSnapshot::capture(
                        e.previous,
                        Some(e.request_id),
                        e.occurred_at,
                    ));
                    line.status = LineStatus::ReprintRequested;
                }
            }
            OrderEvent::ReprintResolved(e) => self.apply_reprint_resolved(e),
        }

        self.updated_at = Some(event.occurred_at());

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::TransitionStatus(cmd) => self.handle_transition(cmd),
            OrderCommand::ReleaseHold(cmd) => self.handle_release_hold(cmd),
            OrderCommand::PlaceUnderReview(cmd) => self.handle_place_under_review(cmd),
            OrderCommand::ResolveReview(cmd) => self.handle_resolve_review(cmd),
            OrderCommand::AssignDesigner(cmd) => self.handle_assign_designer(cmd),
            OrderCommand::SetLineStatus(cmd) => self.handle_set_line_status(cmd),
            OrderCommand::MarkInvoiced(cmd) => self.handle_mark_invoiced(cmd),
            OrderCommand::ReleaseFromInvoice(cmd) => self.handle_release_from_invoice(cmd),
            OrderCommand::RecordRefund(cmd) => self.handle_record_refund(cmd),
            OrderCommand::RequestReprint(cmd) => self.handle_request_reprint(cmd),
            OrderCommand::ResolveReprint(cmd) => self.handle_resolve_reprint(cmd),
        }
    }
}

impl Order {
    fn line_mut(&mut self, line_id: LineId) -> Option<&mut OrderLine> {
        self.lines.iter_mut().find(|l| l.line_id == line_id)
    }

    fn apply_reprint_resolved(&mut self, e: &ReprintResolved) {
        let Some(idx) = self.lines.iter().position(|l| l.line_id == e.line_id) else {
            return;
        };

        match e.resolution {
            ReprintResolution::Approve { new_line_id } => {
                let original = &mut self.lines[idx];
                original.status = LineStatus::Reprinted;
                original.pending_reprint = None;

                let clone = OrderLine {
                    line_id: new_line_id,
                    variant_sku: original.variant_sku.clone(),
                    product_name: original.product_name.clone(),
                    quantity: original.quantity,
                    unit_price: 0,
                    status: LineStatus::ReadyProduction,
                    designer: original.designer,
                    reprint_of: Some(original.line_id),
                    pending_reprint: None,
                };
                self.lines.push(clone);
            }
            ReprintResolution::Reject => {
                let line = &mut self.lines[idx];
                if let Some(snapshot) = line.pending_reprint.take() {
                    line.status = snapshot.previous;
                }
            }
        }
    }

    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_not_under_review(&self) -> Result<(), DomainError> {
        if self.is_under_review() {
            return Err(DomainError::conflict("order is under review"));
        }
        Ok(())
    }

    fn ensure_line_editable(&self, line_id: LineId) -> Result<&OrderLine, DomainError> {
        if self.is_terminal() {
            return Err(DomainError::invariant(
                "cannot change lines of a cancelled or refunded order",
            ));
        }
        let line = self
            .line(line_id)
            .ok_or_else(|| DomainError::validation(format!("unknown line {line_id}")))?;
        if line.pending_reprint.is_some() {
            return Err(DomainError::conflict("line has a pending reprint request"));
        }
        Ok(line)
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }

        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("order code must not be empty"));
        }

        if cmd.lines.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }

        let mut total: u64 = 0;
        for (idx, line) in cmd.lines.iter().enumerate() {
            if line.quantity == 0 {
                return Err(DomainError::validation("quantity must be positive"));
            }
            if line.variant_sku.trim().is_empty() {
                return Err(DomainError::validation("variant sku must not be empty"));
            }
            if cmd.lines[..idx].iter().any(|l| l.line_id == line.line_id) {
                return Err(DomainError::validation("duplicate line id"));
            }
            let subtotal = u64::from(line.quantity)
                .checked_mul(line.unit_price)
                .ok_or_else(|| DomainError::validation("line total overflows"))?;
            total = total
                .checked_add(subtotal)
                .ok_or_else(|| DomainError::validation("order total overflows"))?;
        }

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            seller_id: cmd.seller_id,
            code: cmd.code.trim().to_string(),
            customer_ref: cmd.customer_ref.clone(),
            lines: cmd.lines.clone(),
            total_cost: total,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionStatus) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        self.ensure_not_under_review()?;

        let table = TransitionTable::for_workflow(Workflow::Production);
        if !table.allows(self.status, cmd.target) {
            return Err(DomainError::invalid_transition(self.status, cmd.target));
        }

        if cmd.target == OrderStatus::Hold {
            return Ok(vec![OrderEvent::HoldPlaced(HoldPlaced {
                order_id: cmd.order_id,
                previous: self.status,
                held_as: OrderStatus::Hold,
                request_id: None,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            })]);
        }

        Ok(vec![OrderEvent::StatusChanged(StatusChanged {
            order_id: cmd.order_id,
            from: self.status,
            to: cmd.target,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release_hold(&self, cmd: &ReleaseHold) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        self.ensure_not_under_review()?;

        let snapshot = match (&self.provisional, self.status) {
            (Some(snapshot), OrderStatus::Hold) => snapshot,
            _ => return Err(DomainError::invalid_transition(self.status, "release")),
        };

        Ok(vec![OrderEvent::HoldResolved(HoldResolved {
            order_id: cmd.order_id,
            request_id: None,
            resolved_to: snapshot.previous,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_place_under_review(
        &self,
        cmd: &PlaceUnderReview,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if let Some(existing) = self.provisional.as_ref().and_then(|s| s.request_id) {
            return Err(DomainError::duplicate_request(format!(
                "order {} already has pending request {existing}",
                self.code
            )));
        }

        let held_as = match cmd.workflow {
            Workflow::Cancellation => OrderStatus::Hold,
            Workflow::Refund => OrderStatus::Refund,
            Workflow::Production => {
                return Err(DomainError::validation(
                    "production moves do not go through review",
                ));
            }
        };

        let table = TransitionTable::for_workflow(cmd.workflow);
        if !table.allows(self.status, held_as) {
            return Err(DomainError::invalid_transition(self.status, held_as));
        }

        Ok(vec![OrderEvent::HoldPlaced(HoldPlaced {
            order_id: cmd.order_id,
            previous: self.status,
            held_as,
            request_id: Some(cmd.request_id),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn held_by(&self, request_id: AggregateId) -> Result<&StatusSnapshot<OrderStatus>, DomainError> {
        self.provisional
            .as_ref()
            .filter(|s| s.belongs_to(request_id))
            .ok_or_else(|| DomainError::conflict("order is not held by this request"))
    }

    fn handle_resolve_review(&self, cmd: &ResolveReview) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        let snapshot = self.held_by(cmd.request_id)?;

        let resolved_to = match (cmd.resolution, self.status) {
            (ReviewResolution::Restore, _) => snapshot.previous,
            (ReviewResolution::Finalize, OrderStatus::Hold) => OrderStatus::Cancelled,
            (ReviewResolution::Finalize, OrderStatus::Refund) => OrderStatus::Refund,
            (ReviewResolution::Finalize, other) => {
                return Err(DomainError::invariant(format!(
                    "order held by a request cannot sit in {other:?}"
                )));
            }
        };

        Ok(vec![OrderEvent::HoldResolved(HoldResolved {
            order_id: cmd.order_id,
            request_id: Some(cmd.request_id),
            resolved_to,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_designer(&self, cmd: &AssignDesigner) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        let line = self.ensure_line_editable(cmd.line_id)?;

        if line.designer == Some(cmd.designer) {
            return Ok(vec![]);
        }

        Ok(vec![OrderEvent::DesignerAssigned(DesignerAssigned {
            order_id: cmd.order_id,
            line_id: cmd.line_id,
            designer: cmd.designer,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_line_status(&self, cmd: &SetLineStatus) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        let line = self.ensure_line_editable(cmd.line_id)?;

        if !line.status.can_move_to(cmd.status) {
            return Err(DomainError::invalid_transition(line.status, cmd.status));
        }

        Ok(vec![OrderEvent::LineStatusChanged(LineStatusChanged {
            order_id: cmd.order_id,
            line_id: cmd.line_id,
            from: line.status,
            to: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_invoiced(&self, cmd: &MarkInvoiced) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        match self.invoice_id {
            Some(existing) if existing == cmd.invoice_id => return Ok(vec![]),
            Some(_) => {
                return Err(DomainError::conflict(format!(
                    "order {} is already on an invoice",
                    self.code
                )));
            }
            None => {}
        }

        if self.status != OrderStatus::Shipped {
            return Err(DomainError::validation(format!(
                "order {} is not shipped",
                self.code
            )));
        }

        Ok(vec![OrderEvent::Invoiced(Invoiced {
            order_id: cmd.order_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release_from_invoice(
        &self,
        cmd: &ReleaseFromInvoice,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.invoice_id != Some(cmd.invoice_id) {
            return Err(DomainError::conflict("order is not on this invoice"));
        }

        Ok(vec![OrderEvent::InvoiceReleased(InvoiceReleased {
            order_id: cmd.order_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_refund(&self, cmd: &RecordRefund) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;
        let snapshot = self.held_by(cmd.request_id)?;

        if self.status != OrderStatus::Refund {
            return Err(DomainError::conflict("order is not under refund review"));
        }

        if cmd.amount == 0 {
            return Err(DomainError::validation("refund amount must be positive"));
        }

        let refundable = self.refundable_amount();
        if cmd.amount > refundable {
            return Err(DomainError::AmountExceedsBalance {
                amount: cmd.amount,
                balance: refundable,
            });
        }

        let resolved_to = if cmd.amount == refundable {
            OrderStatus::Refund
        } else {
            snapshot.previous
        };

        Ok(vec![
            OrderEvent::RefundRecorded(RefundRecorded {
                order_id: cmd.order_id,
                request_id: cmd.request_id,
                entry_id: cmd.entry_id,
                amount: cmd.amount,
                occurred_at: cmd.occurred_at,
            }),
            OrderEvent::HoldResolved(HoldResolved {
                order_id: cmd.order_id,
                request_id: Some(cmd.request_id),
                resolved_to,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            }),
        ])
    }

    fn handle_request_reprint(&self, cmd: &RequestReprint) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        if self.is_terminal() {
            return Err(DomainError::invalid_transition(self.status, "reprint"));
        }

        let line = self
            .line(cmd.line_id)
            .ok_or_else(|| DomainError::validation(format!("unknown line {}", cmd.line_id)))?;

        if line.pending_reprint.is_some() {
            return Err(DomainError::duplicate_request(format!(
                "line {} already has a pending reprint",
                cmd.line_id
            )));
        }

        if !line.status.can_request_reprint() {
            return Err(DomainError::invalid_transition(
                line.status,
                LineStatus::ReprintRequested,
            ));
        }

        Ok(vec![OrderEvent::ReprintRequested(ReprintRequested {
            order_id: cmd.order_id,
            line_id: cmd.line_id,
            request_id: cmd.request_id,
            previous: line.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_resolve_reprint(&self, cmd: &ResolveReprint) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_order_id(cmd.order_id)?;

        let line = self
            .line(cmd.line_id)
            .ok_or_else(|| DomainError::validation(format!("unknown line {}", cmd.line_id)))?;

        let held = line
            .pending_reprint
            .as_ref()
            .is_some_and(|s| s.belongs_to(cmd.request_id));
        if !held {
            return Err(DomainError::conflict("line is not held by this request"));
        }

        if let ReprintResolution::Approve { new_line_id } = cmd.resolution {
            if self.line(new_line_id).is_some() {
                return Err(DomainError::validation("duplicate line id"));
            }
        }

        Ok(vec![OrderEvent::ReprintResolved(ReprintResolved {
            order_id: cmd.order_id,
            line_id: cmd.line_id,
            request_id: cmd.request_id,
            resolution: cmd.resolution,
            occurred_at: cmd.occurred_at,
        })])
    }
}
