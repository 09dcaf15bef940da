//! Session lifecycle tests driven through the HTTP router.
//!
//! Tests cover:
//! - One session row per user, last login wins
//! - Unknown email and wrong password look identical
//! - Verify served from the cache after login
//! - Refresh without rotation, straight from the identity source
//! - Malformed bodies answered with 400 JSON errors
//! - Logout revokes the refresh token but not issued access tokens
//! - Logout always clears the cookie

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use futures::future::join_all;

#[tokio::test]
async fn test_login_returns_tokens_and_cookie() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;

    let response = ctx.login("alice@example.com", PASSWORD).await;
    assert_eq!(response.status(), 200);

    let cookie = refresh_set_cookie(&response).unwrap();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(cookie.contains(&format!("Max-Age={}", 7 * 24 * 60 * 60)));

    let body = body_json(response).await;
    assert!(body["accessToken"].as_str().is_some());
    assert_eq!(body["user"]["id"], user_id.as_str());
    assert_eq!(body["user"]["email"], "alice@example.com");
}

#[tokio::test]
async fn test_login_missing_fields() {
    let ctx = setup().await;

    let response = ctx.login("", PASSWORD).await;
    assert_eq!(response.status(), 400);

    let response = ctx.login("alice@example.com", "").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    let post = |uri: &str, content_type: Option<&str>, body: &str| {
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Forwarded-For", CLIENT_IP);
        if let Some(content_type) = content_type {
            request = request.header("Content-Type", content_type);
        }
        request.body(axum::body::Body::from(body.to_string())).unwrap()
    };

    let cases = [
        ("/api/auth/login", Some("application/json"), r#"{"email":5,"password":"x"}"#),
        ("/api/auth/login", Some("application/json"), "{"),
        ("/api/auth/login", None, r#"{"email":"alice@example.com","password":"correct-horse-1"}"#),
        ("/api/auth/register", Some("application/json"), r#"{"username":["a"],"email":"b@example.com","password":"password1"}"#),
        ("/api/auth/register", None, r#"{"username":"b","email":"b@example.com","password":"password1"}"#),
    ];
    for (uri, content_type, body) in cases {
        let response = ctx.send(post(uri, content_type, body)).await;
        assert_eq!(response.status(), 400, "{} {:?} {}", uri, content_type, body);
        assert!(refresh_set_cookie(&response).is_none());
        assert!(body_json(response).await["error"].as_str().is_some());
    }

    // Nothing was created or signed in along the way
    assert!(ctx.db.users().get_by_email("b@example.com").await.unwrap().is_none());
    assert_eq!(ctx.login("alice@example.com", PASSWORD).await.status(), 200);
}

#[tokio::test]
async fn test_sequential_logins_keep_one_session() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;

    let mut last = String::new();
    for _ in 0..3 {
        let (_, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;
        last = refresh;
    }

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM session_tokens WHERE user_id = ?")
            .bind(&user_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    let row = ctx.db.tokens().get_by_user(&user_id).await.unwrap().unwrap();
    assert_eq!(row.token, last);
}

#[tokio::test]
async fn test_concurrent_logins_leave_one_row() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;

    let responses = join_all((0..4).map(|_| ctx.login("alice@example.com", PASSWORD))).await;

    let issued: Vec<String> = responses
        .iter()
        .map(|r| {
            assert_eq!(r.status(), 200);
            refresh_token_from(r).unwrap()
        })
        .collect();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM session_tokens WHERE user_id = ?")
            .bind(&user_id)
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    let row = ctx.db.tokens().get_by_user(&user_id).await.unwrap().unwrap();
    assert!(issued.contains(&row.token));
}

#[tokio::test]
async fn test_unknown_email_and_wrong_password_are_identical() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    let unknown = ctx.login("nobody@example.com", PASSWORD).await;
    let wrong = ctx.login("alice@example.com", "wrong-password-1").await;

    assert_eq!(unknown.status(), 401);
    assert_eq!(wrong.status(), 401);
    assert!(refresh_set_cookie(&unknown).is_none());

    let unknown = body_json(unknown).await;
    let wrong = body_json(wrong).await;
    assert_eq!(unknown, wrong);
    assert_eq!(unknown, serde_json::json!({ "error": "Invalid credentials" }));
}

#[tokio::test]
async fn test_verify_after_login_hits_cache() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, _) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    let response = ctx.verify(&access).await;
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["user"]["id"], user_id.as_str());

    assert_eq!(ctx.identities.id_lookups(), 0);
    let stats = ctx.state.cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn test_verify_reads_through_on_cold_cache() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, _) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;
    ctx.state.cache.clear_all();

    assert_eq!(ctx.verify(&access).await.status(), 200);
    assert_eq!(ctx.verify(&access).await.status(), 200);

    // Only the first verify went to the source
    assert_eq!(ctx.identities.id_lookups(), 1);
}

#[tokio::test]
async fn test_verify_failures_collapse_to_401() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    // Garbage, a refresh token in the access slot, and a deleted user
    for token in ["not-a-token", refresh.as_str()] {
        let response = ctx.verify(token).await;
        assert_eq!(response.status(), 401);
        assert_eq!(body_json(response).await["valid"], false);
    }

    ctx.db.users().delete(&user_id).await.unwrap();
    ctx.state.cache.clear_all();
    let response = ctx.verify(&access).await;
    assert_eq!(response.status(), 401);
    assert_eq!(body_json(response).await["valid"], false);
}

#[tokio::test]
async fn test_verify_accepts_post() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, _) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    let verify_post = |token: &str| {
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/auth/verify")
            .header("X-Forwarded-For", CLIENT_IP)
            .header("Authorization", format!("Bearer {}", token))
            .body(axum::body::Body::empty())
            .unwrap()
    };

    let response = ctx.send(verify_post(&access)).await;
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["user"]["email"], "alice@example.com");

    let response = ctx.send(verify_post("not-a-token")).await;
    assert_eq!(response.status(), 401);
    assert_eq!(body_json(response).await["valid"], false);
}

#[tokio::test]
async fn test_verify_without_header() {
    let ctx = setup().await;
    let response = ctx.get("/api/auth/verify").await;
    assert_eq!(response.status(), 401);
    assert_eq!(body_json(response).await["valid"], false);
}

#[tokio::test]
async fn test_refresh_is_not_rotating() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    let first = ctx.refresh(Some(&refresh)).await;
    assert_eq!(first.status(), 200);
    assert!(refresh_set_cookie(&first).is_none());
    let first = body_json(first).await["accessToken"].as_str().unwrap().to_string();

    let second = ctx.refresh(Some(&refresh)).await;
    assert_eq!(second.status(), 200);
    let second = body_json(second).await["accessToken"].as_str().unwrap().to_string();

    assert_ne!(first, access);
    assert_ne!(first, second);
    assert_eq!(ctx.verify(&second).await.status(), 200);
}

#[tokio::test]
async fn test_refresh_bypasses_verification_cache() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (_, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;
    ctx.state.cache.clear_all();
    let before = ctx.state.cache.stats();

    for _ in 0..2 {
        assert_eq!(ctx.refresh(Some(&refresh)).await.status(), 200);
    }

    let after = ctx.state.cache.stats();
    assert_eq!(after.hits, before.hits);
    assert_eq!(after.misses, before.misses);
    assert_eq!(after.sets, before.sets);
    assert_eq!(after.size, 0);
    // Every refresh read the identity source itself
    assert_eq!(ctx.identities.id_lookups(), 2);
}

#[tokio::test]
async fn test_refresh_rejections() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, _) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    assert_eq!(ctx.refresh(None).await.status(), 401);
    assert_eq!(ctx.refresh(Some("garbage")).await.status(), 403);
    // Access tokens are signed with the other secret
    assert_eq!(ctx.refresh(Some(&access)).await.status(), 403);
}

#[tokio::test]
async fn test_second_login_supersedes_first_session() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (first_access, first_refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;
    let (_, second_refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    assert_eq!(ctx.refresh(Some(&first_refresh)).await.status(), 403);
    assert_eq!(ctx.refresh(Some(&second_refresh)).await.status(), 200);
    // The first device's access token stays verifiable until it expires
    assert_eq!(ctx.verify(&first_access).await.status(), 200);
}

#[tokio::test]
async fn test_logout_revokes_refresh_but_not_access() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    let response = ctx.logout(Some(&refresh)).await;
    assert_eq!(response.status(), 204);
    let cookie = refresh_set_cookie(&response).unwrap();
    assert!(cookie.contains("Max-Age=0"));

    assert!(ctx.db.tokens().get_by_user(&user_id).await.unwrap().is_none());
    assert_eq!(ctx.refresh(Some(&refresh)).await.status(), 403);
    assert_eq!(ctx.verify(&access).await.status(), 200);
}

#[tokio::test]
async fn test_logout_with_bearer_only() {
    let ctx = setup().await;
    let user_id = ctx.create_user("alice@example.com", PASSWORD).await;
    let (access, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    let response = ctx
        .send(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/auth/logout")
                .header("X-Forwarded-For", CLIENT_IP)
                .header("Authorization", format!("Bearer {}", access))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 204);

    assert!(ctx.db.tokens().get_by_user(&user_id).await.unwrap().is_none());
    assert_eq!(ctx.refresh(Some(&refresh)).await.status(), 403);
}

#[tokio::test]
async fn test_logout_when_already_logged_out() {
    let ctx = setup().await;

    let response = ctx.logout(None).await;
    assert_eq!(response.status(), 204);
    assert!(refresh_set_cookie(&response).unwrap().contains("Max-Age=0"));

    let response = ctx.logout(Some("garbage")).await;
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn test_logout_store_failure_still_clears_cookie() {
    let ctx = setup().await;
    ctx.create_user("alice@example.com", PASSWORD).await;
    let (_, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;

    ctx.db.pool().close().await;

    let response = ctx.logout(Some(&refresh)).await;
    assert_eq!(response.status(), 500);
    assert!(refresh_set_cookie(&response).unwrap().contains("Max-Age=0"));
    assert_eq!(body_json(response).await["error"], "Internal server error");
}

#[tokio::test]
async fn test_event_sink_failure_does_not_fail_login() {
    let sink = Arc::new(FailingSink::new());
    let ctx = TestSetup::new().with_events(sink.clone()).build().await;
    ctx.create_user("alice@example.com", PASSWORD).await;

    let (_, refresh) = login_tokens(&ctx, "alice@example.com", PASSWORD).await;
    assert_eq!(ctx.logout(Some(&refresh)).await.status(), 204);

    // The worker did try to deliver
    for _ in 0..100 {
        if sink.attempts.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sink.attempts.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let ctx = setup().await;
    ctx.create_user("a@x.com", "correct1").await;

    let response = ctx.login("a@x.com", "correct1").await;
    assert_eq!(response.status(), 200);
    let r1 = refresh_token_from(&response).unwrap();
    let a1 = body_json(response).await["accessToken"].as_str().unwrap().to_string();

    let response = ctx.refresh(Some(&r1)).await;
    assert_eq!(response.status(), 200);
    let a2 = body_json(response).await["accessToken"].as_str().unwrap().to_string();
    assert_ne!(a1, a2);

    assert_eq!(ctx.logout(Some(&r1)).await.status(), 204);
    assert_eq!(ctx.refresh(Some(&r1)).await.status(), 403);
}
