//! Failed-login accumulation per identifier.
//!
//! This sits on top of request rate limiting: it never blocks a request by
//! itself, it only marks failure responses as locked once an identifier has
//! failed too often within the rolling window.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct FailedLogins {
    count: u32,
    first_attempt_at: Instant,
    lock_until: Option<Instant>,
}

impl FailedLogins {
    fn expires_at(&self, window: Duration) -> Instant {
        let rolling = self.first_attempt_at + window;
        match self.lock_until {
            Some(lock_until) if lock_until > rolling => lock_until,
            _ => rolling,
        }
    }
}

/// Outcome of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub failures: u32,
    pub locked: bool,
}

pub struct LockoutTracker {
    entries: DashMap<String, FailedLogins>,
    threshold: u32,
    window: Duration,
}

impl LockoutTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: threshold.max(1),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count a failed login for `identifier`.
    pub fn record_failure(&self, identifier: &str) -> LockoutStatus {
        self.record_failure_at(identifier, Instant::now())
    }

    fn record_failure_at(&self, identifier: &str, now: Instant) -> LockoutStatus {
        // The entry guard holds the shard lock, so the read-modify-write is atomic per key.
        let mut entry = self
            .entries
            .entry(normalize(identifier))
            .or_insert(FailedLogins {
                count: 0,
                first_attempt_at: now,
                lock_until: None,
            });

        if now >= entry.expires_at(self.window) {
            *entry = FailedLogins {
                count: 0,
                first_attempt_at: now,
                lock_until: None,
            };
        }

        entry.count += 1;
        let newly_locked = entry.count >= self.threshold && entry.lock_until.is_none();
        if entry.count >= self.threshold {
            entry.lock_until = Some(now + self.window);
        }
        let status = LockoutStatus {
            failures: entry.count,
            locked: entry.count >= self.threshold,
        };
        drop(entry);

        if newly_locked {
            warn!(
                security_event = true,
                identifier,
                failures = status.failures,
                "Identifier temporarily locked after repeated failed logins"
            );
        }
        status
    }

    /// Whether `identifier` is currently past the failure threshold.
    pub fn is_locked(&self, identifier: &str) -> bool {
        self.is_locked_at(identifier, Instant::now())
    }

    fn is_locked_at(&self, identifier: &str, now: Instant) -> bool {
        self.entries
            .get(&normalize(identifier))
            .and_then(|e| e.lock_until)
            .is_some_and(|until| until > now)
    }

    /// Current failure count, zero once the entry has expired.
    pub fn failures(&self, identifier: &str) -> u32 {
        let now = Instant::now();
        self.entries
            .get(&normalize(identifier))
            .filter(|e| now < e.expires_at(self.window))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Forget all failures for `identifier` (successful login).
    pub fn clear(&self, identifier: &str) {
        self.entries.remove(&normalize(identifier));
    }

    /// Drop entries whose window has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now < e.expires_at(self.window));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}
