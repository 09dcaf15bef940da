//! POST `/register` - Create an identity and sign it in.
//!
//! Creating the identity is the only step that can fail the request. Once it
//! exists, later failures (tokens, session row, provisioning) turn the 201 into
//! a partial success carrying a warning.

use std::time::Instant;

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::error::{ApiError, ApiJson};
use crate::AuthState;
use crate::auth::{ClientIp, refresh_cookie};
use crate::events::AuthEvent;
use crate::identity::{Identity, IdentityError};
use crate::metrics;
use crate::password;
use crate::rate_limit::client_key;

const PARTIAL_SUCCESS_MESSAGE: &str =
    "Registration partially successful. Some features may be limited.";

#[derive(Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    user: Identity,
    message: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    partial_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// Cheap shape check: one `@`, a non-empty local part, a dotted domain.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

fn validate(req: &RegisterRequest) -> Result<(), ApiError> {
    if req.username.trim().is_empty() || req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("Missing required fields"));
    }
    if !is_valid_email(req.email.trim()) {
        return Err(ApiError::bad_request("Invalid email format"));
    }
    password::validate_password_strength(&req.password).map_err(ApiError::bad_request)
}

pub async fn register(
    State(state): State<AuthState>,
    ClientIp(ip): ClientIp,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let limiter = &state.rate_limits.register;
    let permit = limiter.check(&client_key(&ip, Some(&req.email)))?;

    let result = register_inner(&state, &req).await;

    limiter.complete(permit, result.is_ok());
    let status = match &result {
        Err(_) => "failure",
        Ok((_, true)) => "partial",
        Ok((_, false)) => "success",
    };
    metrics::record_auth_operation("register", status);
    metrics::record_auth_duration("register", started.elapsed().as_secs_f64());
    result.map(|(response, _)| response)
}

/// Returns the response and whether it was a partial success.
async fn register_inner(
    state: &AuthState,
    req: &RegisterRequest,
) -> Result<(Response, bool), ApiError> {
    validate(req)?;
    let email = req.email.trim().to_string();
    let username = req.username.trim();

    let secret = req.password.clone();
    let hash = tokio::task::spawn_blocking(move || password::hash_password(&secret))
        .await
        .map_err(|e| ApiError::store_error("Password hashing task failed", e))?
        .map_err(|e| ApiError::store_error("Failed to hash password", e))?;

    let identity = match state.identities.create(&email, &hash).await {
        Ok(identity) => identity,
        Err(IdentityError::Conflict) => {
            info!(security_event = true, "Registration for an existing email");
            return Err(ApiError::bad_request("User with this email already exists"));
        }
        Err(e) => return Err(ApiError::store_error("Failed to create user", e)),
    };
    info!(user_id = %identity.id, "User registered");

    let mut warnings: Vec<&'static str> = Vec::new();
    let mut access_token = None;
    let mut cookie = None;

    match state.issuer.issue_pair(&identity) {
        Ok(pair) => {
            match state
                .tokens
                .upsert_session(&identity.id, &pair.refresh_token, pair.refresh_expires_at)
                .await
            {
                Ok(()) => {
                    cookie = Some(refresh_cookie(
                        &pair.refresh_token,
                        pair.refresh_duration,
                        state.secure_cookies,
                    ));
                }
                Err(e) => {
                    error!(user_id = %identity.id, error = %e, "Failed to save session after registration");
                    warnings.push("Session could not be saved; sign in again to stay logged in.");
                }
            }
            access_token = Some(pair.access_token);
        }
        Err(e) => {
            error!(user_id = %identity.id, error = %e, "Failed to issue tokens after registration");
            warnings.push("Tokens could not be issued; please sign in.");
        }
    }

    state.cache.set(identity.clone());

    if let Err(e) = state.provisioner.provision(&identity, username).await {
        warn!(user_id = %identity.id, error = %e, "Downstream provisioning failed");
        warnings.push("Profile setup could not be completed.");
    }

    state.events.publish(AuthEvent::UserRegistered {
        user_id: identity.id.clone(),
        email: identity.email.clone(),
        username: username.to_string(),
    });

    let partial = !warnings.is_empty();
    let body = Json(RegisterResponse {
        access_token,
        user: identity,
        message: if partial {
            PARTIAL_SUCCESS_MESSAGE
        } else {
            "User registered successfully"
        },
        partial_success: partial,
        warning: partial.then(|| warnings.join(" ")),
    });

    let response = match cookie {
        Some(cookie) => (StatusCode::CREATED, [(SET_COOKIE, cookie)], body).into_response(),
        None => (StatusCode::CREATED, body).into_response(),
    };
    Ok((response, partial))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_email_shape() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last@mail.example.org"));
        assert!(!is_valid_email("ax.com"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a@.com"));
        assert!(!is_valid_email("a@@x.com"));
        assert!(!is_valid_email("a b@x.com"));
    }

    #[test]
    fn test_validate() {
        assert!(validate(&request("alice", "a@x.com", "password1")).is_ok());
        assert!(matches!(
            validate(&request("", "a@x.com", "password1")),
            Err(ApiError::Validation(msg)) if msg == "Missing required fields"
        ));
        assert!(matches!(
            validate(&request("alice", "nope", "password1")),
            Err(ApiError::Validation(msg)) if msg == "Invalid email format"
        ));
        assert!(matches!(
            validate(&request("alice", "a@x.com", "short1")),
            Err(ApiError::Validation(_))
        ));
    }
}
