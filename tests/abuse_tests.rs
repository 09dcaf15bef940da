//! Rate limiting and lockout tests.

mod common;

use std::time::Duration;

use common::*;
use sessionward::rate_limit::RateLimitRule;

#[tokio::test]
async fn test_refresh_rate_limit_and_recovery() {
    let ctx = TestSetup::new()
        .configure(|config| {
            config.rate_limits.refresh = RateLimitRule::new(Duration::from_secs(1), 2);
        })
        .build()
        .await;

    assert_eq!(ctx.refresh(None).await.status(), 401);
    assert_eq!(ctx.refresh(None).await.status(), 401);

    let limited = ctx.refresh(None).await;
    assert_eq!(limited.status(), 429);
    let retry_after: u64 = limited
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body = body_json(limited).await;
    assert_eq!(body["retryAfter"], retry_after);
    assert!(body["error"].as_str().is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(ctx.refresh(None).await.status(), 401);
}

#[tokio::test]
async fn test_failed_logins_are_rate_limited_per_email() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    // Default login window allows 5 attempts per address and email
    for _ in 0..5 {
        let response = ctx.login("alice@example.com", "wrong-password-1").await;
        assert_eq!(response.status(), 401);
    }
    let response = ctx.login("alice@example.com", PASSWORD).await;
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));

    // Another email from the same address has its own window
    ctx.create_user("bob@example.com", PASSWORD).await;
    assert_eq!(ctx.login("bob@example.com", PASSWORD).await.status(), 200);

    // So does the same email from another address
    assert_eq!(
        ctx.login_from("198.51.100.1", "alice@example.com", PASSWORD)
            .await
            .status(),
        200
    );
}

#[tokio::test]
async fn test_successful_logins_do_not_consume_budget() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    for _ in 0..8 {
        assert_eq!(ctx.login("alice@example.com", PASSWORD).await.status(), 200);
    }
}

#[tokio::test]
async fn test_general_limit_applies_to_every_auth_route() {
    let ctx = TestSetup::new()
        .configure(|config| {
            config.rate_limits.general = RateLimitRule::new(Duration::from_secs(60), 3);
        })
        .build()
        .await;

    assert_eq!(ctx.logout(None).await.status(), 204);
    assert_eq!(ctx.refresh(None).await.status(), 401);
    assert_eq!(ctx.get("/api/auth/verify").await.status(), 401);
    assert_eq!(ctx.logout(None).await.status(), 429);

    // Health is outside the auth limiter
    assert_eq!(ctx.get("/api/health").await.status(), 200);
}

#[tokio::test]
async fn test_missing_forwarded_header_is_rejected() {
    let ctx = setup().await;

    let response = ctx
        .send(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/auth/refresh")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_lockout_resets_on_success() {
    let ctx = TestSetup::new()
        .configure(|config| {
            config.max_failed_logins = 3;
            config.rate_limits.login = RateLimitRule::new(Duration::from_secs(60), 100);
        })
        .build()
        .await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    for _ in 0..2 {
        let body = body_json(ctx.login("alice@example.com", "wrong-password-1").await).await;
        assert!(body.get("locked").is_none());
    }
    assert_eq!(ctx.state.lockout.failures("alice@example.com"), 2);

    assert_eq!(ctx.login("alice@example.com", PASSWORD).await.status(), 200);
    assert_eq!(ctx.state.lockout.failures("alice@example.com"), 0);

    // Counting starts again from zero
    for _ in 0..2 {
        let body = body_json(ctx.login("alice@example.com", "wrong-password-1").await).await;
        assert!(body.get("locked").is_none());
    }
}

#[tokio::test]
async fn test_lockout_annotation_after_threshold() {
    let ctx = TestSetup::new()
        .configure(|config| {
            config.max_failed_logins = 3;
            config.lockout_duration = Duration::from_secs(30 * 60);
            config.rate_limits.login = RateLimitRule::new(Duration::from_secs(60), 100);
        })
        .build()
        .await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    for _ in 0..2 {
        let response = ctx.login("alice@example.com", "wrong-password-1").await;
        assert_eq!(response.status(), 401);
        assert!(body_json(response).await.get("locked").is_none());
    }

    let response = ctx.login("Alice@Example.com", "wrong-password-1").await;
    assert_eq!(response.status(), 401);
    let body = body_json(response).await;
    assert_eq!(body["locked"], true);
    assert!(body["error"].as_str().unwrap().contains("30 minutes"));

    // Unknown identifiers are tracked the same way
    for _ in 0..3 {
        ctx.login("ghost@example.com", PASSWORD).await;
    }
    assert!(ctx.state.lockout.is_locked("ghost@example.com"));
}
