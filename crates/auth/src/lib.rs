//! `podledger-auth`: pure authorization boundary.
//!
//! Sellers, staff, designers and managers act on orders, invoices and review
//! requests. The workflows call into this crate themselves, so the rules hold
//! whatever transport delivers the call. Authentication is someone else's job:
//! this crate starts from an already-identified `Principal`.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, authorize, require_owner};
pub use permissions::Permission;
pub use principal::Principal;
pub use roles::{Role, permissions_for_role};
