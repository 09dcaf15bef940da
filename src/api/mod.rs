mod error;
mod health;
mod register;
mod session;

use axum::{
    Router,
    extract::Request,
    http::{
        HeaderValue,
        header::{CACHE_CONTROL, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS},
    },
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};

use crate::AuthState;
use crate::rate_limit::general_rate_limit;

pub use error::{ApiError, ApiJson, ResultExt};

/// JSON 404 for paths no route matches.
pub async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

/// Create the API router.
pub fn create_api_router(state: AuthState) -> Router {
    let auth = Router::new()
        .route("/login", post(session::login))
        .route("/register", post(register::register))
        .route("/verify", get(session::verify).post(session::verify))
        .route("/refresh", post(session::refresh))
        .route("/logout", post(session::logout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            general_rate_limit,
        ));

    let health = Router::new()
        .route("/", get(health::health))
        .route("/cache", get(health::cache_stats))
        .route("/detailed", get(health::detailed));

    Router::new()
        .nest("/auth", auth)
        .nest("/health", health)
        .with_state(state)
}

/// Add the fixed security headers to every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
