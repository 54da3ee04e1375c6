use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::context::PrincipalContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    let principal = principal.principal();
    Json(serde_json::json!({
        "user_id": principal.user_id.to_string(),
        "roles": principal.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "permissions": principal.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
    }))
}
