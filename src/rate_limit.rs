//! Fixed-window rate limiting for the auth endpoints.
//!
//! Each endpoint category has its own limiter. Keys are the client address,
//! optionally joined with the submitted email (`ip:email`). Windows are kept in
//! a sharded map and updated under the entry lock, so concurrent handlers never
//! lose an increment.

use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use crate::AuthState;
use crate::api::ApiError;
use crate::auth::extract_client_ip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitCategory {
    Login,
    Register,
    Refresh,
    General,
}

impl RateLimitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Login => "login",
            RateLimitCategory::Register => "register",
            RateLimitCategory::Refresh => "refresh",
            RateLimitCategory::General => "general",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RateLimitCategory::Login => "Too many login attempts, please try again later",
            RateLimitCategory::Register => "Too many registration attempts, please try again later",
            RateLimitCategory::Refresh => "Too many token refresh attempts, please try again later",
            RateLimitCategory::General => "Too many requests, please slow down",
        }
    }
}

/// Window length, budget, and whether successful requests are given back.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub window: Duration,
    pub max: u32,
    pub skip_successful: bool,
}

impl RateLimitRule {
    pub const fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            skip_successful: false,
        }
    }

    pub const fn skip_successful(mut self) -> Self {
        self.skip_successful = true;
        self
    }
}

/// Rules for every category.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub login: RateLimitRule,
    pub register: RateLimitRule,
    pub refresh: RateLimitRule,
    pub general: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        Self {
            // Only failed logins consume budget
            login: RateLimitRule::new(Duration::from_secs(15 * MINUTE), 5).skip_successful(),
            register: RateLimitRule::new(Duration::from_secs(60 * MINUTE), 3),
            refresh: RateLimitRule::new(Duration::from_secs(15 * MINUTE), 20),
            general: RateLimitRule::new(Duration::from_secs(15 * MINUTE), 100),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started_at: Instant,
}

/// Proof that a request was counted, used to give the slot back on success.
#[derive(Debug, Clone)]
pub struct RatePermit {
    key: String,
    window_started_at: Instant,
}

/// A request refused because its window is exhausted.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub category: RateLimitCategory,
    /// Time until the current window closes
    pub retry_after: Duration,
}

impl RateLimited {
    /// Whole seconds until retry, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 || secs == 0 {
            secs + 1
        } else {
            secs
        }
    }
}

pub struct RateLimiter {
    category: RateLimitCategory,
    rule: RateLimitRule,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(category: RateLimitCategory, rule: RateLimitRule) -> Self {
        Self {
            category,
            rule,
            windows: DashMap::new(),
        }
    }

    /// Count one request against `key`.
    pub fn check(&self, key: &str) -> Result<RatePermit, RateLimited> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<RatePermit, RateLimited> {
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(window.started_at) >= self.rule.window {
            *window = Window {
                count: 0,
                started_at: now,
            };
        }

        if window.count >= self.rule.max {
            let retry_after = self
                .rule
                .window
                .saturating_sub(now.duration_since(window.started_at));
            drop(window);

            warn!(
                security_event = true,
                category = self.category.as_str(),
                key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            crate::metrics::record_rate_limit_rejection(self.category.as_str());
            return Err(RateLimited {
                category: self.category,
                retry_after,
            });
        }

        window.count += 1;
        Ok(RatePermit {
            key: key.to_string(),
            window_started_at: window.started_at,
        })
    }

    /// Report how the counted request ended. With `skip_successful`, a
    /// success gives its slot back as long as its window is still current.
    pub fn complete(&self, permit: RatePermit, success: bool) {
        if !(success && self.rule.skip_successful) {
            return;
        }
        if let Some(mut window) = self.windows.get_mut(&permit.key) {
            if window.started_at == permit.window_started_at {
                window.count = window.count.saturating_sub(1);
            }
        }
    }

    /// Drop windows that have closed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started_at) < self.rule.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// One limiter per endpoint category.
pub struct RateLimits {
    pub login: RateLimiter,
    pub register: RateLimiter,
    pub refresh: RateLimiter,
    pub general: RateLimiter,
}

impl RateLimits {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            login: RateLimiter::new(RateLimitCategory::Login, config.login),
            register: RateLimiter::new(RateLimitCategory::Register, config.register),
            refresh: RateLimiter::new(RateLimitCategory::Refresh, config.refresh),
            general: RateLimiter::new(RateLimitCategory::General, config.general),
        }
    }

    /// Remove closed windows from every limiter.
    pub fn purge_expired(&self) -> usize {
        self.login.purge_expired()
            + self.register.purge_expired()
            + self.refresh.purge_expired()
            + self.general.purge_expired()
    }
}

/// Rate-limit key: the client address, plus the email when one was submitted.
pub fn client_key(ip: &str, email: Option<&str>) -> String {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => format!("{}:{}", ip, email.to_lowercase()),
        None => ip.to_string(),
    }
}

/// Middleware applying the general limit per client address.
pub async fn general_rate_limit(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, state.ip_source) {
        Ok(ip) => ip,
        Err(_) => {
            return ApiError::bad_request("Unable to determine client IP").into_response();
        }
    };

    match state.rate_limits.general.check(&ip) {
        Ok(_) => next.run(request).await,
        Err(limited) => ApiError::from(limited).into_response(),
    }
}
