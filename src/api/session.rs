//! Session API endpoints.
//!
//! - POST `/login` - Check credentials, issue a token pair, set the refresh cookie
//! - GET or POST `/verify` - Check a Bearer access token
//! - POST `/refresh` - Exchange the refresh cookie for a new access token
//! - POST `/logout` - Drop the session row and clear the refresh cookie

use std::time::Instant;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::{ApiError, ApiJson, ResultExt};
use crate::AuthState;
use crate::auth::{
    ClientIp, REFRESH_COOKIE_NAME, bearer_token, clear_refresh_cookie, get_cookie, refresh_cookie,
};
use crate::cache::CacheError;
use crate::credentials::CredentialError;
use crate::events::AuthEvent;
use crate::identity::Identity;
use crate::metrics;
use crate::rate_limit::client_key;
use crate::refresh::RefreshRejection;

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    user: Identity,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
}

#[derive(Serialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

fn outcome(ok: bool) -> &'static str {
    if ok { "success" } else { "failure" }
}

pub async fn login(
    State(state): State<AuthState>,
    ClientIp(ip): ClientIp,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let limiter = &state.rate_limits.login;
    let permit = limiter.check(&client_key(&ip, Some(&req.email)))?;

    let result = login_inner(&state, &ip, &req).await;

    // Successful logins give their slot back
    limiter.complete(permit, result.is_ok());
    metrics::record_auth_operation("login", outcome(result.is_ok()));
    metrics::record_auth_duration("login", started.elapsed().as_secs_f64());
    result
}

async fn login_inner(state: &AuthState, ip: &str, req: &LoginRequest) -> Result<Response, ApiError> {
    let identity = state
        .credentials
        .validate(&req.email, &req.password)
        .await
        .map_err(|e| match e {
            CredentialError::Missing => ApiError::bad_request("Email and password are required"),
            CredentialError::InvalidCredentials { locked } => ApiError::InvalidCredentials {
                locked_for_minutes: locked
                    .then(|| state.lockout.window().as_secs().div_ceil(60).max(1)),
            },
            CredentialError::Unavailable(e) => ApiError::store_error("Failed to check credentials", e),
        })?;

    let pair = state
        .issuer
        .issue_pair(&identity)
        .store_err("Failed to generate tokens")?;

    state
        .tokens
        .upsert_session(&identity.id, &pair.refresh_token, pair.refresh_expires_at)
        .await
        .store_err("Failed to save session")?;

    state.cache.set(identity.clone());
    state.events.publish(AuthEvent::UserLoggedIn {
        user_id: identity.id.clone(),
        email: identity.email.clone(),
        ip: ip.to_string(),
    });
    info!(user_id = %identity.id, "User logged in");

    let cookie = refresh_cookie(
        &pair.refresh_token,
        pair.refresh_duration,
        state.secure_cookies,
    );
    Ok((
        StatusCode::OK,
        [(SET_COOKIE, cookie)],
        Json(LoginResponse {
            access_token: pair.access_token,
            user: identity,
        }),
    )
        .into_response())
}

/// Check the Bearer access token. Never consults the session store, so an
/// access token stays valid after logout until its own expiry.
pub async fn verify(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let result = verify_inner(&state, &headers).await;
    metrics::record_auth_operation("verify", outcome(result.is_ok()));
    metrics::record_auth_duration("verify", started.elapsed().as_secs_f64());

    match result {
        Ok(user) => Json(VerifyResponse {
            valid: true,
            user: Some(user),
            error: None,
        })
        .into_response(),
        Err(message) => (
            StatusCode::UNAUTHORIZED,
            Json(VerifyResponse {
                valid: false,
                user: None,
                error: Some(message),
            }),
        )
            .into_response(),
    }
}

async fn verify_inner(state: &AuthState, headers: &HeaderMap) -> Result<Identity, &'static str> {
    let token = bearer_token(headers).ok_or("No token provided")?;

    let claims = state.issuer.validate_access(token).map_err(|e| {
        debug!(error = %e, "Access token rejected");
        "Invalid token"
    })?;

    match state.cache.get(&claims.sub).await {
        Ok(identity) => Ok(identity),
        Err(CacheError::NotFound) => Err("Invalid token"),
        Err(CacheError::Source(e)) => {
            error!(user_id = %claims.sub, error = %e, "Failed to load identity for verify");
            Err("Invalid token")
        }
    }
}

pub async fn refresh(
    State(state): State<AuthState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    state.rate_limits.refresh.check(&client_key(&ip, None))?;

    let presented = get_cookie(&headers, REFRESH_COOKIE_NAME);
    let result = state.refresh.refresh(presented).await;
    metrics::record_auth_operation("refresh", outcome(result.is_ok()));
    metrics::record_auth_duration("refresh", started.elapsed().as_secs_f64());

    let refreshed = result.map_err(|rejection| match rejection {
        RefreshRejection::NoToken => ApiError::unauthorized("Refresh token not provided"),
        RefreshRejection::InvalidToken => ApiError::forbidden("Invalid refresh token"),
        RefreshRejection::InvalidOrExpired => {
            ApiError::forbidden("Invalid or expired refresh token")
        }
        other => ApiError::store_error("Failed to refresh token", other),
    })?;

    Ok(Json(RefreshResponse {
        access_token: refreshed.access_token,
    })
    .into_response())
}

/// The user being logged out, taken from the refresh cookie or, failing that,
/// from a Bearer access token.
fn logout_subject(state: &AuthState, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = get_cookie(headers, REFRESH_COOKIE_NAME) {
        if let Ok(claims) = state.issuer.validate_refresh(token) {
            return Some(claims.sub);
        }
    }
    bearer_token(headers)
        .and_then(|token| state.issuer.validate_access(token).ok())
        .map(|claims| claims.sub)
}

/// Always clears the refresh cookie, even when the store delete fails.
pub async fn logout(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let clear = [(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))];

    let Some(user_id) = logout_subject(&state, &headers) else {
        debug!("Logout without an identifiable session");
        metrics::record_auth_operation("logout", "success");
        return (StatusCode::NO_CONTENT, clear).into_response();
    };

    if let Err(e) = state.tokens.delete_all(&user_id).await {
        metrics::record_auth_operation("logout", "failure");
        warn!(user_id = %user_id, "Logout could not remove the session");
        return (clear, ApiError::store_error("Failed to delete session", e)).into_response();
    }

    state.cache.evict_one(&user_id);
    state.events.publish(AuthEvent::UserLoggedOut {
        user_id: user_id.clone(),
    });
    metrics::record_auth_operation("logout", "success");
    info!(user_id = %user_id, "User logged out");

    (StatusCode::NO_CONTENT, clear).into_response()
}
