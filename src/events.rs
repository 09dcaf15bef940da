//! Best-effort outbound auth events.
//!
//! Handlers hand events to [`EventPublisher::publish`], which never blocks and
//! never fails the caller. A single worker drains the queue and delivers to the
//! configured [`EventSink`], retrying with backoff before giving up on an event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    UserLoggedIn {
        user_id: String,
        email: String,
        ip: String,
    },
    UserRegistered {
        user_id: String,
        email: String,
        username: String,
    },
    UserLoggedOut {
        user_id: String,
    },
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::UserLoggedIn { .. } => "user_logged_in",
            AuthEvent::UserRegistered { .. } => "user_registered",
            AuthEvent::UserLoggedOut { .. } => "user_logged_out",
        }
    }
}

#[derive(Debug)]
pub enum PublishError {
    /// The downstream bus rejected or could not take the event
    Unavailable(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Unavailable(e) => write!(f, "Event sink unavailable: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

/// Destination for auth events (message bus, audit log, ...).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &AuthEvent) -> Result<(), PublishError>;
}

/// Sink that writes events to the log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, event: &AuthEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        info!(event = event.name(), payload = %payload, "Auth event");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<AuthEvent>,
}

impl EventPublisher {
    /// Start the delivery worker. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize, retry: RetryPolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuthEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver_with_retry(sink.as_ref(), &event, retry).await;
            }
            debug!("Event publisher stopped");
        });

        Self { tx }
    }

    /// Queue an event. Drops it with a warning if the queue is full.
    pub fn publish(&self, event: AuthEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "Event queue full, dropping event");
                crate::metrics::record_event_dropped(event.name());
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = event.name(), "Event worker stopped, dropping event");
                crate::metrics::record_event_dropped(event.name());
            }
        }
    }
}

async fn deliver_with_retry(sink: &dyn EventSink, event: &AuthEvent, retry: RetryPolicy) {
    let mut backoff = retry.initial_backoff;
    let attempts = retry.max_attempts.max(1);

    for attempt in 1..=attempts {
        match sink.deliver(event).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                debug!(event = event.name(), attempt, error = %e, "Event delivery failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                warn!(event = event.name(), attempts, error = %e, "Giving up on event delivery");
            }
        }
    }
}
