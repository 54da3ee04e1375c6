//! Collaborator boundaries: carrier tracking, notifications, discount catalog
//! and the hosted payment-link gateway.
//!
//! Services depend on these traits only. The in-memory implementations back
//! tests and the dev server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::{DomainError, PaymentId, UserId};
use podledger_invoicing::DiscountCode;

/// Opaque carrier status for a parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    PendingPickup,
    HandedOver,
    Delivered,
    Returned,
}

impl ShipmentStatus {
    /// The parcel has left the workshop.
    pub fn is_shipped(&self) -> bool {
        matches!(self, ShipmentStatus::HandedOver | ShipmentStatus::Delivered)
    }
}

pub trait ShipmentTracker: Send + Sync {
    fn shipment_status(&self, order_code: &str) -> Result<ShipmentStatus, DomainError>;
}

impl<T: ShipmentTracker + ?Sized> ShipmentTracker for Arc<T> {
    fn shipment_status(&self, order_code: &str) -> Result<ShipmentStatus, DomainError> {
        (**self).shipment_status(order_code)
    }
}

/// Tracker answering from a fixed table; unknown codes are pending pickup.
#[derive(Debug, Default)]
pub struct StaticShipmentTracker {
    statuses: RwLock<HashMap<String, ShipmentStatus>>,
}

impl StaticShipmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, order_code: impl Into<String>, status: ShipmentStatus) {
        if let Ok(mut statuses) = self.statuses.write() {
            statuses.insert(order_code.into(), status);
        }
    }
}

impl ShipmentTracker for StaticShipmentTracker {
    fn shipment_status(&self, order_code: &str) -> Result<ShipmentStatus, DomainError> {
        let statuses = self
            .statuses
            .read()
            .map_err(|_| DomainError::ExternalGateway("shipment tracker unavailable".into()))?;
        Ok(statuses
            .get(order_code)
            .copied()
            .unwrap_or(ShipmentStatus::PendingPickup))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub message: String,
    pub redirect_url: String,
}

pub trait NotificationService: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), DomainError>;
}

impl<T: NotificationService + ?Sized> NotificationService for Arc<T> {
    fn notify(&self, notification: Notification) -> Result<(), DomainError> {
        (**self).notify(notification)
    }
}

/// Records notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl NotificationService for InMemoryNotifier {
    fn notify(&self, notification: Notification) -> Result<(), DomainError> {
        self.sent
            .lock()
            .map_err(|_| DomainError::ExternalGateway("notifier unavailable".into()))?
            .push(notification);
        Ok(())
    }
}

pub trait DiscountValidator: Send + Sync {
    /// Amount taken off `applicable`, or `InvalidDiscount(reason)`.
    fn validate(&self, code: &str, applicable: u64, now: DateTime<Utc>)
    -> Result<u64, DomainError>;
}

impl<T: DiscountValidator + ?Sized> DiscountValidator for Arc<T> {
    fn validate(
        &self,
        code: &str,
        applicable: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, DomainError> {
        (**self).validate(code, applicable, now)
    }
}

/// Discount codes keyed case-insensitively.
#[derive(Debug, Default)]
pub struct InMemoryDiscountCatalog {
    codes: RwLock<HashMap<String, DiscountCode>>,
}

impl InMemoryDiscountCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, code: DiscountCode) {
        if let Ok(mut codes) = self.codes.write() {
            codes.insert(code.code.to_uppercase(), code);
        }
    }
}

impl DiscountValidator for InMemoryDiscountCatalog {
    fn validate(
        &self,
        code: &str,
        applicable: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, DomainError> {
        let codes = self
            .codes
            .read()
            .map_err(|_| DomainError::ExternalGateway("discount catalog unavailable".into()))?;
        let discount = codes
            .get(&code.trim().to_uppercase())
            .ok_or_else(|| DomainError::InvalidDiscount(format!("unknown code {code}")))?;
        discount.amount_off(applicable, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLinkRequest {
    pub invoice_number: String,
    pub amount: u64,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLink {
    pub checkout_url: String,
    pub reference: String,
}

pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout for `request`. Failures are
    /// `DomainError::ExternalGateway` and may be retried by the caller.
    fn create_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, DomainError>;
}

impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    fn create_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, DomainError> {
        (**self).create_link(request)
    }
}

/// Builds checkout URLs locally under `base_url` without calling out.
#[derive(Debug, Clone)]
pub struct HostedCheckoutGateway {
    base_url: String,
}

impl HostedCheckoutGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl PaymentGateway for HostedCheckoutGateway {
    fn create_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, DomainError> {
        if self.base_url.is_empty() {
            return Err(DomainError::ExternalGateway(
                "payment link base url is not configured".into(),
            ));
        }
        Ok(PaymentLink {
            checkout_url: format!(
                "{}/{}?amount={}&invoice={}",
                self.base_url.trim_end_matches('/'),
                request.reference,
                request.amount,
                request.invoice_number
            ),
            reference: request.reference.clone(),
        })
    }
}

/// Gateway order codes must be numeric and fit in 53 bits; the low 48 bits of
/// the payment id satisfy both.
pub fn gateway_reference(payment_id: PaymentId) -> String {
    let low = payment_id.as_uuid().as_u128() & 0xFFFF_FFFF_FFFF;
    low.to_string()
}
