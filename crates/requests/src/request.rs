use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::{Aggregate, AggregateId, AggregateRoot, DomainError, LineId, UserId};
use podledger_events::Event;
use podledger_orders::{LineStatus, OrderId, OrderStatus};

/// Review request identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub AggregateId);

impl RequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Refund,
    Cancellation,
    Reprint,
}

/// Kind-specific payload, including the state captured before the order or
/// line was moved into its provisional state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RequestDetails {
    Refund {
        order_id: OrderId,
        amount: u64,
        previous_status: OrderStatus,
    },
    Cancellation {
        order_id: OrderId,
        previous_status: OrderStatus,
    },
    Reprint {
        order_id: OrderId,
        line_id: LineId,
        previous_line_status: LineStatus,
    },
}

impl RequestDetails {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestDetails::Refund { .. } => RequestKind::Refund,
            RequestDetails::Cancellation { .. } => RequestKind::Cancellation,
            RequestDetails::Reprint { .. } => RequestKind::Reprint,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            RequestDetails::Refund { order_id, .. }
            | RequestDetails::Cancellation { order_id, .. }
            | RequestDetails::Reprint { order_id, .. } => *order_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// Outcome of a staff review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    Approved,
    Rejected { reason: String },
}

/// Aggregate root: a refund, cancellation or reprint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    id: RequestId,
    details: Option<RequestDetails>,
    reason: String,
    proof: Option<String>,
    requester: Option<UserId>,
    status: RequestStatus,
    reviewer: Option<UserId>,
    rejection_reason: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    reviewed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl ReviewRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            details: None,
            reason: String::new(),
            proof: None,
            requester: None,
            status: RequestStatus::Pending,
            reviewer: None,
            rejection_reason: None,
            submitted_at: None,
            reviewed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RequestId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn details(&self) -> Option<&RequestDetails> {
        self.details.as_ref()
    }

    pub fn kind(&self) -> Option<RequestKind> {
        self.details.as_ref().map(RequestDetails::kind)
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.details.as_ref().map(RequestDetails::order_id)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn proof(&self) -> Option<&str> {
        self.proof.as_deref()
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.created && self.status == RequestStatus::Pending
    }

    pub fn reviewer(&self) -> Option<UserId> {
        self.reviewer
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn reviewed_at(&self) -> Option<DateTime<Utc>> {
        self.reviewed_at
    }
}

impl AggregateRoot for ReviewRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SubmitRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub request_id: RequestId,
    pub details: RequestDetails,
    pub reason: String,
    pub proof: Option<String>,
    pub requester: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordDecision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDecision {
    pub request_id: RequestId,
    pub decision: Decision,
    pub reviewer: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    SubmitRequest(SubmitRequest),
    RecordDecision(RecordDecision),
}

/// Event: RequestSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubmitted {
    pub request_id: RequestId,
    pub details: RequestDetails,
    pub reason: String,
    pub proof: Option<String>,
    pub requester: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestApproved {
    pub request_id: RequestId,
    pub reviewer: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub request_id: RequestId,
    pub reviewer: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    RequestSubmitted(RequestSubmitted),
    RequestApproved(RequestApproved),
    RequestRejected(RequestRejected),
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::RequestSubmitted(_) => "requests.request.submitted",
            RequestEvent::RequestApproved(_) => "requests.request.approved",
            RequestEvent::RequestRejected(_) => "requests.request.rejected",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::RequestSubmitted(e) => e.occurred_at,
            RequestEvent::RequestApproved(e) => e.occurred_at,
            RequestEvent::RequestRejected(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ReviewRequest {
    type Command = RequestCommand;
    type Event = RequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RequestEvent::RequestSubmitted(e) => {
                self.id = e.request_id;
                self.details = Some(e.details.clone());
                self.reason = e.reason.clone();
                self.proof = e.proof.clone();
                self.requester = Some(e.requester);
                self.status = RequestStatus::Pending;
                self.submitted_at = Some(e.occurred_at);
                self.created = true;
            }
            RequestEvent::RequestApproved(e) => {
                self.status = RequestStatus::Approved;
                self.reviewer = Some(e.reviewer);
                self.reviewed_at = Some(e.occurred_at);
            }
            RequestEvent::RequestRejected(e) => {
                self.status = RequestStatus::Rejected;
                self.reviewer = Some(e.reviewer);
                self.rejection_reason = Some(e.reason.clone());
                self.reviewed_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RequestCommand::SubmitRequest(cmd) => self.handle_submit(cmd),
            RequestCommand::RecordDecision(cmd) => self.handle_decision(cmd),
        }
    }
}

impl ReviewRequest {
    fn handle_submit(&self, cmd: &SubmitRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("request already exists"));
        }

        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("a reason is required"));
        }

        if let RequestDetails::Refund { amount: 0, .. } = cmd.details {
            return Err(DomainError::validation("refund amount must be positive"));
        }

        Ok(vec![RequestEvent::RequestSubmitted(RequestSubmitted {
            request_id: cmd.request_id,
            details: cmd.details.clone(),
            reason: cmd.reason.trim().to_string(),
            proof: cmd.proof.clone(),
            requester: cmd.requester,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_decision(&self, cmd: &RecordDecision) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != cmd.request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }

        if self.status != RequestStatus::Pending {
            return Err(DomainError::conflict(format!(
                "request was already {:?}",
                self.status
            )));
        }

        match &cmd.decision {
            Decision::Approved => Ok(vec![RequestEvent::RequestApproved(RequestApproved {
                request_id: cmd.request_id,
                reviewer: cmd.reviewer,
                occurred_at: cmd.occurred_at,
            })]),
            Decision::Rejected { reason } => {
                if reason.trim().is_empty() {
                    return Err(DomainError::validation("a rejection reason is required"));
                }
                Ok(vec![RequestEvent::RequestRejected(RequestRejected {
                    request_id: cmd.request_id,
                    reviewer: cmd.reviewer,
                    reason: reason.trim().to_string(),
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request_id() -> RequestId {
        RequestId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn submitted(details: RequestDetails) -> ReviewRequest {
        let request_id = test_request_id();
        let mut request = ReviewRequest::empty(request_id);
        let events = request
            .handle(&RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                details,
                reason: "misprint on sleeve".to_string(),
                proof: Some("https://cdn.example/proof.jpg".to_string()),
                requester: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap();
        request.apply(&events[0]);
        request
    }

    fn decide(request: &ReviewRequest, decision: Decision) -> Result<Vec<RequestEvent>, DomainError> {
        request.handle(&RequestCommand::RecordDecision(RecordDecision {
            request_id: request.id_typed(),
            decision,
            reviewer: UserId::new(),
            occurred_at: test_time(),
        }))
    }

    #[test]
    fn submitted_request_is_pending() {
        let order_id = OrderId::new(AggregateId::new());
        let request = submitted(RequestDetails::Cancellation {
            order_id,
            previous_status: OrderStatus::Designing,
        });

        assert!(request.is_pending());
        assert_eq!(request.kind(), Some(RequestKind::Cancellation));
        assert_eq!(request.order_id(), Some(order_id));
        assert_eq!(request.version(), 1);
    }

    #[test]
    fn zero_refund_is_rejected_at_submission() {
        let request_id = test_request_id();
        let request = ReviewRequest::empty(request_id);
        let err = request
            .handle(&RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                details: RequestDetails::Refund {
                    order_id: OrderId::new(AggregateId::new()),
                    amount: 0,
                    previous_status: OrderStatus::Shipped,
                },
                reason: "damaged".to_string(),
                proof: None,
                requester: UserId::new(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejection_stores_reason_and_is_final() {
        let mut request = submitted(RequestDetails::Reprint {
            order_id: OrderId::new(AggregateId::new()),
            line_id: LineId::new(),
            previous_line_status: LineStatus::Completed,
        });

        let events = decide(
            &request,
            Decision::Rejected {
                reason: "print is within tolerance".to_string(),
            },
        )
        .unwrap();
        request.apply(&events[0]);

        assert_eq!(request.status(), RequestStatus::Rejected);
        assert_eq!(request.rejection_reason(), Some("print is within tolerance"));
        assert!(request.reviewer().is_some());

        let err = decide(&request, Decision::Approved).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn rejection_requires_reason() {
        let request = submitted(RequestDetails::Cancellation {
            order_id: OrderId::new(AggregateId::new()),
            previous_status: OrderStatus::Draft,
        });
        let err = decide(
            &request,
            Decision::Rejected {
                reason: "  ".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn decision_serializes_with_tag() {
        let json = serde_json::to_value(Decision::Rejected {
            reason: "no".to_string(),
        })
        .unwrap();
        assert_eq!(json["decision"], "rejected");
        assert_eq!(json["reason"], "no");
    }
}
