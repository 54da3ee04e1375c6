use std::collections::HashSet;

use thiserror::Error;

use podledger_core::{DomainError, UserId};

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: {actor} does not own this resource")]
    NotOwner { actor: UserId },
}

impl From<AuthzError> for DomainError {
    fn from(value: AuthzError) -> Self {
        DomainError::unauthorized(value.to_string())
    }
}

/// Check that the principal holds `required` (or the wildcard).
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let perms: HashSet<&str> = principal.permissions.iter().map(|p| p.as_str()).collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Check that the principal is the owner of a seller-scoped resource.
///
/// Managers (wildcard) pass; everyone else must match `owner` exactly.
pub fn require_owner(principal: &Principal, owner: UserId) -> Result<(), AuthzError> {
    if principal.user_id == owner || principal.permissions.iter().any(Permission::is_wildcard) {
        Ok(())
    } else {
        Err(AuthzError::NotOwner {
            actor: principal.user_id,
        })
    }
}
