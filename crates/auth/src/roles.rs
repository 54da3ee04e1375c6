use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier used for RBAC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const SELLER: Role = Role(Cow::Borrowed("seller"));
    pub const DESIGNER: Role = Role(Cow::Borrowed("designer"));
    pub const STAFF: Role = Role(Cow::Borrowed("staff"));
    pub const MANAGER: Role = Role(Cow::Borrowed("manager"));
    /// Internal actor used by the webhook reconciler.
    pub const SYSTEM: Role = Role(Cow::Borrowed("system"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static role → permission policy.
///
/// Unknown roles grant nothing.
pub fn permissions_for_role(role: &Role) -> Vec<Permission> {
    match role.as_str() {
        "seller" => vec![
            Permission::ORDERS_CREATE,
            Permission::PAYMENTS_LINK,
            Permission::REQUESTS_SUBMIT,
        ],
        "designer" => vec![Permission::ORDERS_TRANSITION],
        "staff" => vec![
            Permission::ORDERS_CREATE,
            Permission::ORDERS_TRANSITION,
            Permission::INVOICES_CREATE,
            Permission::PAYMENTS_RECORD,
            Permission::PAYMENTS_LINK,
            Permission::REQUESTS_REVIEW,
        ],
        "manager" => vec![Permission::WILDCARD],
        "system" => vec![Permission::PAYMENTS_RECORD],
        _ => vec![],
    }
}
