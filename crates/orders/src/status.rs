//! Order and line status machines.
//!
//! The order status is one field shared by the production, cancellation and
//! refund flows. Each flow gets its own explicit transition table; the
//! provisional states (`Hold`, `Refund`) are entered together with a
//! [`StatusSnapshot`] so a rejected review can put back exactly what was there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::AggregateId;

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    AssignedDesigner,
    Designing,
    CheckFileDesign,
    SellerApprovedDesign,
    SellerRejectDesign,
    ReadyProduction,
    InProduction,
    ProdRework,
    QcPending,
    QcApproved,
    Confirmed,
    Shipped,
    Hold,
    Cancelled,
    Refund,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 16] = [
        OrderStatus::Draft,
        OrderStatus::AssignedDesigner,
        OrderStatus::Designing,
        OrderStatus::CheckFileDesign,
        OrderStatus::SellerApprovedDesign,
        OrderStatus::SellerRejectDesign,
        OrderStatus::ReadyProduction,
        OrderStatus::InProduction,
        OrderStatus::ProdRework,
        OrderStatus::QcPending,
        OrderStatus::QcApproved,
        OrderStatus::Confirmed,
        OrderStatus::Shipped,
        OrderStatus::Hold,
        OrderStatus::Cancelled,
        OrderStatus::Refund,
    ];

    /// States that are only ever entered with a snapshot of the prior state.
    pub fn is_provisional(self) -> bool {
        matches!(self, OrderStatus::Hold | OrderStatus::Refund)
    }

    /// States an order can still be cancelled from.
    pub fn is_pre_shipment(self) -> bool {
        !matches!(
            self,
            OrderStatus::Shipped | OrderStatus::Hold | OrderStatus::Cancelled | OrderStatus::Refund
        )
    }
}

/// Per-line production status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Draft,
    Designing,
    ReadyProduction,
    InProduction,
    Completed,
    ReprintRequested,
    Reprinted,
}

impl LineStatus {
    /// Manual production moves. `ReprintRequested` and `Reprinted` are only
    /// reachable through the reprint workflow.
    pub fn can_move_to(self, next: LineStatus) -> bool {
        use LineStatus::*;
        matches!(
            (self, next),
            (Draft, Designing)
                | (Draft, ReadyProduction)
                | (Designing, ReadyProduction)
                | (ReadyProduction, InProduction)
                | (InProduction, Completed)
        )
    }

    pub fn can_request_reprint(self) -> bool {
        matches!(self, LineStatus::InProduction | LineStatus::Completed)
    }
}

/// The flow a transition is evaluated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Production,
    Cancellation,
    Refund,
}

type Edges = &'static [(OrderStatus, &'static [OrderStatus])];

const PRODUCTION_EDGES: Edges = {
    use OrderStatus::*;
    &[
        (Draft, &[AssignedDesigner, ReadyProduction, Hold, Cancelled]),
        (AssignedDesigner, &[Designing, Hold, Cancelled]),
        (Designing, &[CheckFileDesign, Hold, Cancelled]),
        (CheckFileDesign, &[SellerApprovedDesign, SellerRejectDesign, Hold, Cancelled]),
        (SellerRejectDesign, &[Designing, Hold, Cancelled]),
        (SellerApprovedDesign, &[ReadyProduction, Hold, Cancelled]),
        (ReadyProduction, &[InProduction, Hold, Cancelled]),
        (InProduction, &[QcPending, Hold]),
        (ProdRework, &[InProduction, Hold]),
        (QcPending, &[QcApproved, ProdRework, Hold]),
        (QcApproved, &[Confirmed, Hold]),
        (Confirmed, &[Shipped, Hold]),
        (Hold, &[Cancelled]),
    ]
};

const CANCELLATION_EDGES: Edges = {
    use OrderStatus::*;
    &[
        (Draft, &[Hold]),
        (AssignedDesigner, &[Hold]),
        (Designing, &[Hold]),
        (CheckFileDesign, &[Hold]),
        (SellerApprovedDesign, &[Hold]),
        (SellerRejectDesign, &[Hold]),
        (ReadyProduction, &[Hold]),
        (InProduction, &[Hold]),
        (ProdRework, &[Hold]),
        (QcPending, &[Hold]),
        (QcApproved, &[Hold]),
        (Confirmed, &[Hold]),
        (Hold, &[Cancelled]),
    ]
};

const REFUND_EDGES: Edges = {
    use OrderStatus::*;
    &[(Confirmed, &[Refund]), (Shipped, &[Refund])]
};

/// Explicit allowed-transition table for one workflow.
///
/// Anything not listed is rejected. `Cancelled` and `Refund` have no outgoing
/// edges in any table: leaving `Refund` is only possible by restoring a
/// snapshot, never by a forward move.
#[derive(Debug, Clone, Copy)]
pub struct TransitionTable {
    workflow: Workflow,
    edges: Edges,
}

impl TransitionTable {
    pub fn for_workflow(workflow: Workflow) -> Self {
        let edges = match workflow {
            Workflow::Production => PRODUCTION_EDGES,
            Workflow::Cancellation => CANCELLATION_EDGES,
            Workflow::Refund => REFUND_EDGES,
        };
        Self { workflow, edges }
    }

    pub fn workflow(&self) -> Workflow {
        self.workflow
    }

    pub fn targets(&self, from: OrderStatus) -> &'static [OrderStatus] {
        self.edges
            .iter()
            .find(|(src, _)| *src == from)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn allows(&self, from: OrderStatus, to: OrderStatus) -> bool {
        self.targets(from).contains(&to)
    }
}

/// Captured prior state for a provisional transition.
///
/// `request_id` is set when a review request placed the state; manual holds
/// leave it empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot<S> {
    pub previous: S,
    pub request_id: Option<AggregateId>,
    pub captured_at: DateTime<Utc>,
}

impl<S: Copy> StatusSnapshot<S> {
    pub fn capture(previous: S, request_id: Option<AggregateId>, captured_at: DateTime<Utc>) -> Self {
        Self {
            previous,
            request_id,
            captured_at,
        }
    }

    pub fn belongs_to(&self, request_id: AggregateId) -> bool {
        self.request_id == Some(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for workflow in [Workflow::Production, Workflow::Cancellation, Workflow::Refund] {
            let table = TransitionTable::for_workflow(workflow);
            assert!(table.targets(OrderStatus::Cancelled).is_empty());
            assert!(table.targets(OrderStatus::Refund).is_empty());
        }
    }

    #[test]
    fn production_cannot_skip_quality_control() {
        let table = TransitionTable::for_workflow(Workflow::Production);
        assert!(table.allows(OrderStatus::InProduction, OrderStatus::QcPending));
        assert!(!table.allows(OrderStatus::InProduction, OrderStatus::Confirmed));
        assert!(!table.allows(OrderStatus::Draft, OrderStatus::Shipped));
    }

    #[test]
    fn production_never_enters_refund_directly() {
        let table = TransitionTable::for_workflow(Workflow::Production);
        for from in OrderStatus::ALL {
            assert!(!table.allows(from, OrderStatus::Refund), "{from:?} -> Refund");
        }
    }

    #[test]
    fn cancellation_holds_only_unshipped_orders() {
        let table = TransitionTable::for_workflow(Workflow::Cancellation);
        for from in OrderStatus::ALL {
            assert_eq!(
                table.allows(from, OrderStatus::Hold),
                from.is_pre_shipment(),
                "{from:?}"
            );
        }
    }

    #[test]
    fn refund_review_starts_from_confirmed_or_shipped() {
        let table = TransitionTable::for_workflow(Workflow::Refund);
        assert!(table.allows(OrderStatus::Shipped, OrderStatus::Refund));
        assert!(table.allows(OrderStatus::Confirmed, OrderStatus::Refund));
        assert!(!table.allows(OrderStatus::InProduction, OrderStatus::Refund));
    }

    #[test]
    fn line_reprint_states_are_workflow_only() {
        assert!(!LineStatus::Completed.can_move_to(LineStatus::ReprintRequested));
        assert!(!LineStatus::ReprintRequested.can_move_to(LineStatus::Reprinted));
        assert!(LineStatus::Completed.can_request_reprint());
        assert!(!LineStatus::Draft.can_request_reprint());
    }
}
