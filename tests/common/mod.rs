#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use sessionward::{
    AuthState, Collaborators, ServerConfig,
    auth::{IpSource, REFRESH_COOKIE_NAME},
    create_app,
    db::{Database, UserStore},
    events::{AuthEvent, EventSink, LogSink, PublishError},
    identity::{
        Identity, IdentityError, IdentityRecord, IdentitySource, NoopProvisioner, Provisioner,
    },
    jwt::TokenConfig,
    password::hash_password,
};
use tower::ServiceExt;

pub const ACCESS_SECRET: &[u8] = b"test-access-secret-0123456789abcdef";
pub const REFRESH_SECRET: &[u8] = b"test-refresh-secret-0123456789abcdef";
pub const PASSWORD: &str = "correct-horse-1";
pub const CLIENT_IP: &str = "203.0.113.7";

pub struct TestContext {
    pub app: Router,
    pub state: AuthState,
    pub db: Database,
    pub identities: Arc<CountingSource>,
}

/// Builder for a test app backed by an in-memory database.
pub struct TestSetup {
    configure: Option<Box<dyn FnOnce(&mut ServerConfig)>>,
    events: Arc<dyn EventSink>,
    provisioner: Arc<dyn Provisioner>,
}

impl TestSetup {
    pub fn new() -> Self {
        Self {
            configure: None,
            events: Arc::new(LogSink),
            provisioner: Arc::new(NoopProvisioner),
        }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut ServerConfig) + 'static) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub async fn build(self) -> TestContext {
        let db = Database::open(":memory:")
            .await
            .expect("Failed to open test database");

        let mut config = ServerConfig::new(db.clone(), TokenConfig::new(ACCESS_SECRET, REFRESH_SECRET));
        config.ip_source = IpSource::XForwardedFor;
        if let Some(configure) = self.configure {
            configure(&mut config);
        }

        let identities = Arc::new(CountingSource::new(db.users()));
        let state = AuthState::with_collaborators(
            &config,
            Collaborators {
                identities: identities.clone(),
                events: self.events,
                provisioner: self.provisioner,
            },
        );

        TestContext {
            app: create_app(state.clone()),
            state,
            db,
            identities,
        }
    }
}

pub async fn setup() -> TestContext {
    TestSetup::new().build().await
}

impl TestContext {
    /// Insert a user directly with a real password hash. Returns the user ID.
    pub async fn create_user(&self, email: &str, password: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let hash = hash_password(password).unwrap();
        self.db.users().create(&id, email, &hash).await.unwrap();
        id
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn login(&self, email: &str, password: &str) -> Response<Body> {
        self.login_from(CLIENT_IP, email, password).await
    }

    pub async fn login_from(&self, ip: &str, email: &str, password: &str) -> Response<Body> {
        self.send(json_request(
            "/api/auth/login",
            ip,
            serde_json::json!({ "email": email, "password": password }),
        ))
        .await
    }

    pub async fn refresh(&self, refresh_token: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/auth/refresh")
            .header("X-Forwarded-For", CLIENT_IP);
        if let Some(token) = refresh_token {
            builder = builder.header(header::COOKIE, format!("{}={}", REFRESH_COOKIE_NAME, token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn verify(&self, access_token: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .uri("/api/auth/verify")
                .header("X-Forwarded-For", CLIENT_IP)
                .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn logout(&self, refresh_token: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .header("X-Forwarded-For", CLIENT_IP);
        if let Some(token) = refresh_token {
            builder = builder.header(header::COOKIE, format!("{}={}", REFRESH_COOKIE_NAME, token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Response<Body> {
        self.send(json_request(
            "/api/auth/register",
            CLIENT_IP,
            serde_json::json!({ "username": username, "email": email, "password": password }),
        ))
        .await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .uri(uri)
                .header("X-Forwarded-For", CLIENT_IP)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub fn json_request(uri: &str, ip: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Forwarded-For", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// The full `Set-Cookie` header for the refresh cookie, if one was set.
pub fn refresh_set_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{}=", REFRESH_COOKIE_NAME)))
        .map(str::to_string)
}

/// The refresh token value carried by a `Set-Cookie` header, if non-empty.
pub fn refresh_token_from(response: &Response<Body>) -> Option<String> {
    let cookie = refresh_set_cookie(response)?;
    let value = cookie
        .split(';')
        .next()?
        .strip_prefix(&format!("{}=", REFRESH_COOKIE_NAME))?;
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Log in and return (access token, refresh token).
pub async fn login_tokens(ctx: &TestContext, email: &str, password: &str) -> (String, String) {
    let response = ctx.login(email, password).await;
    assert_eq!(response.status(), 200);
    let refresh = refresh_token_from(&response).expect("login sets the refresh cookie");
    let body = body_json(response).await;
    let access = body["accessToken"].as_str().unwrap().to_string();
    (access, refresh)
}

/// Identity source that counts lookups before delegating to the SQL store.
pub struct CountingSource {
    inner: UserStore,
    by_email: AtomicUsize,
    by_id: AtomicUsize,
}

impl CountingSource {
    pub fn new(inner: UserStore) -> Self {
        Self {
            inner,
            by_email: AtomicUsize::new(0),
            by_id: AtomicUsize::new(0),
        }
    }

    pub fn id_lookups(&self) -> usize {
        self.by_id.load(Ordering::SeqCst)
    }

    pub fn email_lookups(&self) -> usize {
        self.by_email.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for CountingSource {
    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityRecord>, IdentityError> {
        self.by_email.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_email(email).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError> {
        self.by_id.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_id(id).await
    }

    async fn create(&self, email: &str, password_hash: &str) -> Result<Identity, IdentityError> {
        IdentitySource::create(&self.inner, email, password_hash).await
    }
}

/// Event sink whose broker is always down.
pub struct FailingSink {
    pub attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventSink for FailingSink {
    async fn deliver(&self, _event: &AuthEvent) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Unavailable("broker down".to_string()))
    }
}

/// Downstream provisioning that always fails.
pub struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(&self, _identity: &Identity, _username: &str) -> Result<(), IdentityError> {
        Err(IdentityError::Unavailable("profile service down".to_string()))
    }
}
