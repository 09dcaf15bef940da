//! Background sweeping of dead refresh sessions.
//!
//! Each tick deletes sessions that expired or were invalidated, then deletes
//! anything older than the retention ceiling regardless of state. Ticks never
//! overlap: a tick that comes due while another is still running is skipped.
//! A failed or panicking tick is logged and the schedule carries on.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{StoreError, TokenStore};
use crate::lockout::LockoutTracker;
use crate::rate_limit::RateLimits;

/// Interval between cleanup runs.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sessions older than this are removed even if still valid.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// What one sweep removed and what is left.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_or_invalid: u64,
    pub past_retention: u64,
    pub active_remaining: Option<i64>,
    pub oldest_active_age_secs: Option<i64>,
    pub rate_limit_windows_purged: usize,
    pub lockout_entries_purged: usize,
    pub finished_at: u64,
}

#[derive(Debug)]
pub enum SweepError {
    /// Another sweep holds the tick lock
    AlreadyRunning,
    Store(StoreError),
}

impl std::fmt::Display for SweepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepError::AlreadyRunning => write!(f, "A sweep is already running"),
            SweepError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SweepError {}

impl From<StoreError> for SweepError {
    fn from(e: StoreError) -> Self {
        SweepError::Store(e)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweeperStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub retention_secs: u64,
    /// Estimated Unix time of the next scheduled tick
    pub next_run_at: Option<u64>,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub skipped_runs: u64,
    pub last_report: Option<SweepReport>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct SweeperState {
    handle: Option<JoinHandle<()>>,
    next_run_at: Option<u64>,
    completed_runs: u64,
    failed_runs: u64,
    skipped_runs: u64,
    last_report: Option<SweepReport>,
    last_error: Option<String>,
}

pub struct CleanupSweeper {
    tokens: TokenStore,
    interval: Duration,
    retention: Duration,
    rate_limits: Option<Arc<RateLimits>>,
    lockout: Option<Arc<LockoutTracker>>,
    tick_lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SweeperState>,
}

impl CleanupSweeper {
    pub fn new(tokens: TokenStore, interval: Duration, retention: Duration) -> Self {
        Self {
            tokens,
            interval,
            retention,
            rate_limits: None,
            lockout: None,
            tick_lock: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SweeperState::default()),
        }
    }

    /// Also drop closed rate-limit windows and stale lockout entries on each tick.
    pub fn with_memory_purge(mut self, rate_limits: Arc<RateLimits>, lockout: Arc<LockoutTracker>) -> Self {
        self.rate_limits = Some(rate_limits);
        self.lockout = Some(lockout);
        self
    }

    fn state(&self) -> MutexGuard<'_, SweeperState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the schedule. The first tick runs immediately. Calling this on a
    /// running sweeper does nothing, and a zero interval never schedules.
    pub fn start(self: &Arc<Self>) {
        if self.interval.is_zero() {
            error!("Token cleanup interval is zero, not scheduling cleanup");
            return;
        }

        let mut state = self.state();
        if state.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let sweeper = Arc::clone(self);
        state.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                sweeper.state().next_run_at = Some(unix_now() + sweeper.interval.as_secs());

                // Detached so a slow tick cannot delay the schedule; the tick
                // lock decides whether it actually runs.
                let tick = Arc::clone(&sweeper);
                tokio::spawn(async move {
                    let run = tokio::spawn(async move { tick.run_scheduled().await });
                    if let Err(e) = run.await {
                        error!(error = %e, "Token cleanup tick panicked");
                    }
                });
            }
        }));

        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Token cleanup scheduler started"
        );
    }

    /// Stop the schedule. A tick already in progress finishes.
    pub fn stop(&self) {
        let mut state = self.state();
        if let Some(handle) = state.handle.take() {
            handle.abort();
            info!("Token cleanup scheduler stopped");
        }
        state.next_run_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.state()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> SweeperStatus {
        let running = self.is_running();
        let state = self.state();
        SweeperStatus {
            running,
            interval_secs: self.interval.as_secs(),
            retention_secs: self.retention.as_secs(),
            next_run_at: if running { state.next_run_at } else { None },
            completed_runs: state.completed_runs,
            failed_runs: state.failed_runs,
            skipped_runs: state.skipped_runs,
            last_report: state.last_report.clone(),
            last_error: state.last_error.clone(),
        }
    }

    async fn run_scheduled(&self) {
        match self.run_now().await {
            Ok(_) => {}
            Err(SweepError::AlreadyRunning) => {
                self.state().skipped_runs += 1;
                warn!("Previous token cleanup still running, skipping this tick");
            }
            // Already logged and recorded by run_now
            Err(SweepError::Store(_)) => {}
        }
    }

    /// Run one sweep now, outside the schedule.
    pub async fn run_now(&self) -> Result<SweepReport, SweepError> {
        let _guard = self
            .tick_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SweepError::AlreadyRunning)?;

        match self.sweep().await {
            Ok(report) => {
                let mut state = self.state();
                state.completed_runs += 1;
                state.last_report = Some(report.clone());
                state.last_error = None;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Token cleanup failed");
                let mut state = self.state();
                state.failed_runs += 1;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let expired_or_invalid = self.tokens.delete_expired_or_invalid().await?;
        let past_retention = self.tokens.delete_older_than(self.retention).await?;
        crate::metrics::record_cleanup_deleted("expired_or_invalid", expired_or_invalid);
        crate::metrics::record_cleanup_deleted("retention", past_retention);

        // Statistics are informational; failing to read them does not fail the sweep
        let active_remaining = match self.tokens.count_active().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count active sessions");
                None
            }
        };
        let now = unix_now();
        let oldest_active_age_secs = match self.tokens.oldest_active_created_at().await {
            Ok(oldest) => oldest.map(|created| (now as i64).saturating_sub(created)),
            Err(e) => {
                warn!(error = %e, "Failed to read oldest active session");
                None
            }
        };

        let rate_limit_windows_purged = self
            .rate_limits
            .as_ref()
            .map(|limits| limits.purge_expired())
            .unwrap_or(0);
        let lockout_entries_purged = self
            .lockout
            .as_ref()
            .map(|lockout| lockout.purge_expired())
            .unwrap_or(0);

        let report = SweepReport {
            expired_or_invalid,
            past_retention,
            active_remaining,
            oldest_active_age_secs,
            rate_limit_windows_purged,
            lockout_entries_purged,
            finished_at: now,
        };

        if expired_or_invalid > 0 || past_retention > 0 {
            info!(
                expired_or_invalid,
                past_retention,
                active_remaining = ?active_remaining,
                "Cleaned up refresh sessions"
            );
        } else {
            debug!(active_remaining = ?active_remaining, "Token cleanup found nothing to remove");
        }
        Ok(report)
    }

    /// Mark every session of a user invalid (forced sign-out).
    /// The rows are removed on the next sweep.
    pub async fn invalidate_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let count = self.tokens.invalidate_all(user_id).await?;
        info!(user_id, count, "Invalidated user sessions");
        Ok(count)
    }

    /// Delete every session of a user (account deletion).
    pub async fn purge_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let count = self.tokens.delete_all(user_id).await?;
        info!(user_id, count, "Deleted user sessions");
        Ok(count)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
