#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use crit::mail::{Mailer, MemoryMailer};
use crit::rate_limit::RateLimiterFacade;
use crit::repo::inmem::InMemRepo;
use crit::{config, AppState};
use serial_test::serial;
use std::sync::Arc;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CRIT_DATA_DIR", tmp.path().to_str().unwrap());
}

fn app_state(mailer: &Arc<MemoryMailer>) -> AppState {
    let dyn_mailer: Arc<dyn Mailer> = mailer.clone();
    AppState {
        repo: Arc::new(InMemRepo::new()),
        mailer: dyn_mailer,
        limits: RateLimiterFacade::disabled(),
    }
}

fn last_code(mailer: &MemoryMailer) -> String {
    let sent = mailer.sent();
    let body = &sent.last().expect("at least one mail").body;
    body.rsplit(' ').next().unwrap().to_string()
}

#[actix_web::test]
#[serial]
async fn signup_then_token_then_me() {
    setup_env();
    let mailer = Arc::new(MemoryMailer::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(&mailer)))
            .configure(config),
    )
    .await;

    // sign up
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(&serde_json::json!({"username":"alice","email":"alice@example.com"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(body["username"], "alice");
    assert_eq!(body["role"], "user");

    // exactly one mail with the code
    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    let code = last_code(&mailer);
    assert_eq!(code.len(), 40);

    // exchange the code for a token
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/token")
        .set_json(&serde_json::json!({"username":"alice","confirmation_code":code}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let token = body["token"].as_str().unwrap().to_string();

    // the token opens the self-profile endpoint
    let req = test::TestRequest::get()
        .uri("/api/v1/users/me")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["username"], "alice");
}

#[actix_web::test]
#[serial]
async fn signup_is_idempotent_for_exact_pair_and_rotates_code() {
    setup_env();
    let mailer = Arc::new(MemoryMailer::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(&mailer)))
            .configure(config),
    )
    .await;

    let payload = serde_json::json!({"username":"bob","email":"bob@example.com"});
    let req = test::TestRequest::post().uri("/api/v1/auth/signup").set_json(&payload).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    let first_code = last_code(&mailer);

    // same pair again: still 200, a fresh code is issued
    let req = test::TestRequest::post().uri("/api/v1/auth/signup").set_json(&payload).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    let second_code = last_code(&mailer);
    assert_eq!(mailer.sent().len(), 2);
    assert_ne!(first_code, second_code);

    // the overwritten code no longer verifies
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/token")
        .set_json(&serde_json::json!({"username":"bob","confirmation_code":first_code}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/token")
        .set_json(&serde_json::json!({"username":"bob","confirmation_code":second_code}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
}

#[actix_web::test]
#[serial]
async fn signup_rejects_partial_collisions() {
    setup_env();
    let mailer = Arc::new(MemoryMailer::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(&mailer)))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(&serde_json::json!({"username":"carol","email":"carol@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // same username, different email
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(&serde_json::json!({"username":"carol","email":"other@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // same email, different username
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(&serde_json::json!({"username":"other","email":"carol@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // no extra mail went out for the failed attempts
    assert_eq!(mailer.sent().len(), 1);
}

#[actix_web::test]
#[serial]
async fn signup_validates_username_and_email() {
    setup_env();
    let mailer = Arc::new(MemoryMailer::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(&mailer)))
            .configure(config),
    )
    .await;

    for (username, email) in [
        ("me", "me@example.com"),              // reserved word
        ("bad name!", "ok@example.com"),       // charset violation
        ("ok", "not-an-email"),                // malformed email
        ("ok", "a@b"),                         // no domain dot
    ] {
        let req = test::TestRequest::post()
            .uri("/api/v1/auth/signup")
            .set_json(&serde_json::json!({"username":username,"email":email}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{username} / {email}");
    }
    assert!(mailer.sent().is_empty());
}

#[actix_web::test]
#[serial]
async fn token_errors_distinguish_unknown_user_from_bad_code() {
    setup_env();
    let mailer = Arc::new(MemoryMailer::new());
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state(&mailer)))
            .configure(config),
    )
    .await;

    // unknown username -> 404
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/token")
        .set_json(&serde_json::json!({"username":"ghost","confirmation_code":"whatever"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // known username, wrong code -> 400
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(&serde_json::json!({"username":"dave","email":"dave@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/token")
        .set_json(&serde_json::json!({"username":"dave","confirmation_code":"0000"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}
