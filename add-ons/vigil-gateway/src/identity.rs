//! Caller identity, asserted by the auth proxy in front of the gateway.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use vigil_core::{Identity, UserRole};

use crate::error::ApiError;

pub const USER_HEADER: &str = "x-vigil-user";
pub const ROLE_HEADER: &str = "x-vigil-role";

/// `X-Vigil-User` is required; `X-Vigil-Role` defaults to `user`.
pub struct Caller(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let user_id = header(USER_HEADER).ok_or(ApiError::Unauthenticated)?.to_string();
        let role = header(ROLE_HEADER).map(UserRole::parse).unwrap_or_default();
        Ok(Caller(Identity { user_id, role }))
    }
}
