//! Axum extractors and header helpers.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use tracing::warn;

use super::ip::extract_client_ip;
use crate::AuthState;
use crate::api::ApiError;

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Client address resolved with the configured [`super::IpSource`].
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<AuthState> for ClientIp {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthState,
    ) -> Result<Self, Self::Rejection> {
        extract_client_ip(parts, state.ip_source)
            .map(ClientIp)
            .map_err(|reason| {
                warn!(reason, "Unable to determine client IP");
                ApiError::bad_request("Unable to determine client IP")
            })
    }
}
