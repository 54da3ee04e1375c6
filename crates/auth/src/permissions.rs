use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque strings (e.g. "requests.review"). The wildcard
/// `"*"` grants everything and is reserved for the manager role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));

    pub const ORDERS_CREATE: Permission = Permission(Cow::Borrowed("orders.create"));
    pub const ORDERS_TRANSITION: Permission = Permission(Cow::Borrowed("orders.transition"));
    pub const INVOICES_CREATE: Permission = Permission(Cow::Borrowed("invoices.create"));
    pub const INVOICES_CANCEL: Permission = Permission(Cow::Borrowed("invoices.cancel"));
    pub const PAYMENTS_RECORD: Permission = Permission(Cow::Borrowed("payments.record"));
    pub const PAYMENTS_LINK: Permission = Permission(Cow::Borrowed("payments.link"));
    pub const REQUESTS_SUBMIT: Permission = Permission(Cow::Borrowed("requests.submit"));
    pub const REQUESTS_REVIEW: Permission = Permission(Cow::Borrowed("requests.review"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
