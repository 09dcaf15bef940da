//! Health and cache statistics endpoints.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{Json, extract::State};
use serde::Serialize;

use crate::AuthState;
use crate::cache::CacheStats;
use crate::cleanup::SweeperStatus;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: u64,
    uptime_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealthResponse {
    #[serde(flatten)]
    health: HealthResponse,
    cache: CacheStats,
    sweeper: SweeperStatus,
}

fn basic(state: &AuthState) -> HealthResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        timestamp,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }
}

pub async fn health(State(state): State<AuthState>) -> Json<HealthResponse> {
    Json(basic(&state))
}

pub async fn cache_stats(State(state): State<AuthState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn detailed(State(state): State<AuthState>) -> Json<DetailedHealthResponse> {
    Json(DetailedHealthResponse {
        health: basic(&state),
        cache: state.cache.stats(),
        sweeper: state.sweeper.status(),
    })
}
