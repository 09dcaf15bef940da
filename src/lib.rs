pub mod api;
pub mod auth;
pub mod cache;
pub mod cleanup;
pub mod cli;
pub mod credentials;
pub mod db;
pub mod events;
pub mod identity;
pub mod jwt;
pub mod lockout;
pub mod metrics;
pub mod password;
pub mod rate_limit;
pub mod refresh;

use api::create_api_router;
use auth::IpSource;
use axum::Router;
use cache::{DEFAULT_CACHE_CAPACITY, VerificationCache};
use cleanup::{CleanupSweeper, DEFAULT_CLEANUP_INTERVAL, DEFAULT_RETENTION};
use credentials::CredentialValidator;
use db::{DEFAULT_STORE_TIMEOUT, Database, TokenStore};
use events::{DEFAULT_QUEUE_CAPACITY, EventPublisher, EventSink, LogSink, RetryPolicy};
use identity::{IdentitySource, NoopProvisioner, Provisioner};
use jwt::{TokenConfig, TokenIssuer};
use lockout::LockoutTracker;
use rate_limit::{RateLimitConfig, RateLimits};
use refresh::RefreshRotationProtocol;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Default failed logins before an identifier is marked locked.
pub const DEFAULT_MAX_FAILED_LOGINS: u32 = 10;

/// Default rolling window for failed-login counting.
pub const DEFAULT_LOCKOUT_DURATION: Duration = Duration::from_secs(30 * 60);

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Secrets, lifetimes, issuer and audience for both token kinds
    pub tokens: TokenConfig,
    /// Verification cache capacity. Its TTL is the access token lifetime.
    pub cache_capacity: usize,
    /// Upper bound for a single session store call
    pub store_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Sessions older than this are swept even if valid
    pub retention: Duration,
    pub max_failed_logins: u32,
    pub lockout_duration: Duration,
    pub rate_limits: RateLimitConfig,
    /// Where the client address comes from (requires a proxy for header sources)
    pub ip_source: IpSource,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
}

impl ServerConfig {
    /// Config with default limits and lifetimes.
    pub fn new(db: Database, tokens: TokenConfig) -> Self {
        Self {
            db,
            tokens,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            retention: DEFAULT_RETENTION,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            lockout_duration: DEFAULT_LOCKOUT_DURATION,
            rate_limits: RateLimitConfig::default(),
            ip_source: IpSource::default(),
            secure_cookies: false,
        }
    }
}

/// Outside collaborators the session core talks to.
pub struct Collaborators {
    pub identities: Arc<dyn IdentitySource>,
    pub events: Arc<dyn EventSink>,
    pub provisioner: Arc<dyn Provisioner>,
}

impl Collaborators {
    /// SQL identity source, logging event sink, no downstream provisioning.
    pub fn defaults(db: &Database) -> Self {
        Self {
            identities: Arc::new(db.users()),
            events: Arc::new(LogSink),
            provisioner: Arc::new(NoopProvisioner),
        }
    }
}

/// Everything request handlers and the sweeper share.
#[derive(Clone)]
pub struct AuthState {
    pub identities: Arc<dyn IdentitySource>,
    pub credentials: Arc<CredentialValidator>,
    pub issuer: Arc<TokenIssuer>,
    pub tokens: TokenStore,
    pub cache: Arc<VerificationCache>,
    pub lockout: Arc<LockoutTracker>,
    pub rate_limits: Arc<RateLimits>,
    pub refresh: Arc<RefreshRotationProtocol>,
    pub sweeper: Arc<CleanupSweeper>,
    pub events: EventPublisher,
    pub provisioner: Arc<dyn Provisioner>,
    pub ip_source: IpSource,
    pub secure_cookies: bool,
    pub started_at: Instant,
}

impl AuthState {
    /// Build the state with the default collaborators.
    /// Must be called inside a Tokio runtime (the event worker is spawned here).
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_collaborators(config, Collaborators::defaults(&config.db))
    }

    pub fn with_collaborators(config: &ServerConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            identities,
            events: sink,
            provisioner,
        } = collaborators;

        let issuer = Arc::new(TokenIssuer::new(&config.tokens));
        let tokens = config.db.tokens_with_timeout(config.store_timeout);
        let cache = Arc::new(VerificationCache::new(
            identities.clone(),
            config.cache_capacity,
            config.tokens.access_ttl,
        ));
        let lockout = Arc::new(LockoutTracker::new(
            config.max_failed_logins,
            config.lockout_duration,
        ));
        let rate_limits = Arc::new(RateLimits::new(config.rate_limits));
        let credentials = Arc::new(CredentialValidator::new(identities.clone(), lockout.clone()));
        let refresh = Arc::new(RefreshRotationProtocol::new(
            issuer.clone(),
            tokens.clone(),
            identities.clone(),
        ));
        let sweeper = Arc::new(
            CleanupSweeper::new(tokens.clone(), config.cleanup_interval, config.retention)
                .with_memory_purge(rate_limits.clone(), lockout.clone()),
        );
        let events = EventPublisher::spawn(sink, DEFAULT_QUEUE_CAPACITY, RetryPolicy::default());

        Self {
            identities,
            credentials,
            issuer,
            tokens,
            cache,
            lockout,
            rate_limits,
            refresh,
            sweeper,
            events,
            provisioner,
            ip_source: config.ip_source,
            secure_cookies: config.secure_cookies,
            started_at: Instant::now(),
        }
    }
}

/// Create the application router.
pub fn create_app(state: AuthState) -> Router {
    Router::new()
        .nest("/api", create_api_router(state))
        .fallback(api::not_found)
        .layer(axum::middleware::from_fn(api::security_headers))
}

/// Start the background sweeper. Its first tick sweeps immediately.
/// Call this before starting the server.
pub async fn init_cleanup(state: &AuthState) {
    state.sweeper.start();
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Call `init_cleanup` before this to run cleanup on startup.
pub async fn run_server(state: AuthState, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(state);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), std::io::Error> {
    let state = AuthState::new(&config);
    init_cleanup(&state).await;

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        run_server(state, listener).await.ok();
    });

    Ok((handle, local_addr))
}
