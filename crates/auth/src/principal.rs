use serde::{Deserialize, Serialize};
use uuid::Uuid;

use podledger_core::UserId;

use crate::{Permission, Role, permissions_for_role};

/// A resolved actor for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub roles: Vec<Role>,
    /// Effective permissions (derived from roles, plus any direct grants).
    pub permissions: Vec<Permission>,
}

impl Principal {
    /// Build a principal whose permissions come from the role policy.
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        let mut permissions: Vec<Permission> = Vec::new();
        for role in &roles {
            for perm in permissions_for_role(role) {
                if !permissions.contains(&perm) {
                    permissions.push(perm);
                }
            }
        }
        Self {
            user_id,
            roles,
            permissions,
        }
    }

    pub fn seller(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::SELLER])
    }

    pub fn staff(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::STAFF])
    }

    pub fn manager(user_id: UserId) -> Self {
        Self::new(user_id, vec![Role::MANAGER])
    }

    /// The reconciler acting on verified gateway notifications.
    pub fn system() -> Self {
        Self::new(UserId::from_uuid(Uuid::nil()), vec![Role::SYSTEM])
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}
