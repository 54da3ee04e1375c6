//! Caller identity from gateway-set headers.
//!
//! Authentication happens upstream; the gateway forwards the user id in
//! `x-user-id` and a comma-separated role list in `x-roles`.

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use podledger_auth::{Principal, Role};
use podledger_core::UserId;

use crate::context::PrincipalContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLES_HEADER: &str = "x-roles";

pub async fn identity_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let principal = principal_from_headers(req.headers())?;
    req.extensions_mut().insert(PrincipalContext::new(principal));
    Ok(next.run(req).await)
}

fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, StatusCode> {
    let user_id: UserId = headers
        .get(USER_ID_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?
        .trim()
        .parse()
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let roles = match headers.get(ROLES_HEADER) {
        Some(value) => parse_roles(value.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?),
        None => Vec::new(),
    };

    Ok(Principal::new(user_id, roles))
}

/// The system role is reserved for internal callers and never taken from
/// headers.
fn parse_roles(raw: &str) -> Vec<Role> {
    raw.split(',')
        .map(|r| r.trim().to_ascii_lowercase())
        .filter(|r| !r.is_empty() && r != Role::SYSTEM.as_str())
        .map(Role::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_trimmed_and_system_is_dropped() {
        let roles = parse_roles(" Seller, staff ,system,,");
        assert_eq!(roles, vec![Role::SELLER, Role::STAFF]);
    }

    #[test]
    fn missing_or_invalid_user_id_is_unauthorized() {
        let mut headers = HeaderMap::new();
        assert_eq!(principal_from_headers(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(USER_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert_eq!(principal_from_headers(&headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn principal_permissions_follow_roles() {
        let user = UserId::new();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, user.to_string().parse().unwrap());
        headers.insert(ROLES_HEADER, "seller".parse().unwrap());

        let principal = principal_from_headers(&headers).unwrap();
        assert_eq!(principal.user_id, user);
        assert_eq!(principal, Principal::seller(user));
    }
}
