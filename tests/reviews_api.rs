#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use crit::auth::{create_jwt, Role};
use crit::mail::{Mailer, MemoryMailer};
use crit::rate_limit::RateLimiterFacade;
use crit::repo::inmem::InMemRepo;
use crit::{config, AppState};
use serial_test::serial;
use std::sync::Arc;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CRIT_DATA_DIR", tmp.path().to_str().unwrap());
}

fn app_state() -> AppState {
    let mailer: Arc<dyn Mailer> = Arc::new(MemoryMailer::new());
    AppState {
        repo: Arc::new(InMemRepo::new()),
        mailer,
        limits: RateLimiterFacade::disabled(),
    }
}

fn admin_token() -> String { create_jwt(1, "admin", vec![Role::Admin]).unwrap() }
fn moderator_token() -> String { create_jwt(2, "mod", vec![Role::Moderator]).unwrap() }
fn token_for(id: i64, name: &str) -> String { create_jwt(id, name, vec![Role::User]).unwrap() }

macro_rules! bearer {
    ($token:expr) => {
        ("Authorization", format!("Bearer {}", $token))
    };
}

// Admin creates a category-less title and yields its id.
macro_rules! seed_title {
    ($app:expr, $name:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/titles")
            .insert_header(bearer!(admin_token()))
            .set_json(&serde_json::json!({"name":$name,"year":2001,"genre":[]}))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let title: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();
        title["id"].as_i64().unwrap()
    }};
}

#[actix_web::test]
#[serial]
async fn one_review_per_author_and_derived_rating() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let title_id = seed_title!(&app, "Solaris");

    // three users, scores 8 / 10 / 6
    for (i, score) in [(10, 8), (11, 10), (12, 6)] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/titles/{title_id}/reviews"))
            .insert_header(bearer!(token_for(i, &format!("reader{i}"))))
            .set_json(&serde_json::json!({"text":"text","score":score}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    // mean of [8, 10, 6] is exactly 8.0
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let title: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(title["rating"], 8.0);

    // a second review by the same author fails the proactive check
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .insert_header(bearer!(token_for(10, "reader10")))
        .set_json(&serde_json::json!({"text":"again","score":5}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // score outside [1, 10] is rejected
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .insert_header(bearer!(token_for(13, "reader13")))
        .set_json(&serde_json::json!({"text":"bad","score":11}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // newest first
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["count"], 3);
    assert_eq!(page["results"][0]["author"], "reader12");
}

#[actix_web::test]
#[serial]
async fn review_mutation_needs_author_or_privilege() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let title_id = seed_title!(&app, "Stalker");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .insert_header(bearer!(token_for(20, "author")))
        .set_json(&serde_json::json!({"text":"mine","score":9}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let review: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let review_id = review["id"].as_i64().unwrap();
    let review_uri = format!("/api/v1/titles/{title_id}/reviews/{review_id}");

    // anonymous edit -> 401
    let req = test::TestRequest::patch()
        .uri(&review_uri)
        .set_json(&serde_json::json!({"text":"hijack"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    // another plain user passes the coarse check but fails on the object -> 403
    let req = test::TestRequest::patch()
        .uri(&review_uri)
        .insert_header(bearer!(token_for(21, "other")))
        .set_json(&serde_json::json!({"text":"hijack"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
    let req = test::TestRequest::delete()
        .uri(&review_uri)
        .insert_header(bearer!(token_for(21, "other")))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    // the author may edit
    let req = test::TestRequest::patch()
        .uri(&review_uri)
        .insert_header(bearer!(token_for(20, "author")))
        .set_json(&serde_json::json!({"score":7}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let review: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(review["score"], 7);

    // a moderator may delete someone else's review
    let req = test::TestRequest::delete()
        .uri(&review_uri)
        .insert_header(bearer!(moderator_token()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::get().uri(&review_uri).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn comments_are_scoped_and_cascade_with_the_title() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let title_id = seed_title!(&app, "Ubik");
    let other_title_id = seed_title!(&app, "Valis");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .insert_header(bearer!(token_for(30, "reviewer")))
        .set_json(&serde_json::json!({"text":"classic","score":10}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let review: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let review_id = review["id"].as_i64().unwrap();

    // comment on the review
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews/{review_id}/comments"))
        .insert_header(bearer!(token_for(31, "commenter")))
        .set_json(&serde_json::json!({"text":"agreed"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let comment: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let comment_id = comment["id"].as_i64().unwrap();

    // the same review under the wrong title is unreachable
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{other_title_id}/reviews/{review_id}/comments"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // comment listing is public, newest first
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}/reviews/{review_id}/comments"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["count"], 1);

    // non-author cannot edit the comment; an admin can
    let req = test::TestRequest::patch()
        .uri(&format!(
            "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{comment_id}"
        ))
        .insert_header(bearer!(token_for(32, "lurker")))
        .set_json(&serde_json::json!({"text":"edited"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
    let req = test::TestRequest::patch()
        .uri(&format!(
            "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{comment_id}"
        ))
        .insert_header(bearer!(admin_token()))
        .set_json(&serde_json::json!({"text":"moderated"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // deleting the title takes the review subtree with it
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/titles/{title_id}"))
        .insert_header(bearer!(admin_token()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}/reviews/{review_id}/comments/{comment_id}"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn self_profile_patch_cannot_escalate_role() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let admin = admin_token();

    // admin provisions the account
    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .insert_header(bearer!(&admin))
        .set_json(&serde_json::json!({"username":"eve","email":"eve@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    // eve patches herself, trying to become admin
    let eve = token_for(5, "eve");
    let req = test::TestRequest::patch()
        .uri("/api/v1/users/me")
        .insert_header(bearer!(&eve))
        .set_json(&serde_json::json!({"role":"admin","bio":"just me"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["role"], "user", "role must stay pinned");
    assert_eq!(me["bio"], "just me");

    // the stored record agrees
    let req = test::TestRequest::get()
        .uri("/api/v1/users/eve")
        .insert_header(bearer!(&admin))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let stored: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stored["role"], "user");

    // an admin PATCH on the user endpoint, by contrast, may change the role
    let req = test::TestRequest::patch()
        .uri("/api/v1/users/eve")
        .insert_header(bearer!(&admin))
        .set_json(&serde_json::json!({"role":"moderator"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let stored: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stored["role"], "moderator");

    // plain users cannot reach the admin surface at all
    let req = test::TestRequest::get()
        .uri("/api/v1/users")
        .insert_header(bearer!(&eve))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
}

#[actix_web::test]
#[serial]
async fn deleting_a_user_removes_their_reviews() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let admin = admin_token();
    let title_id = seed_title!(&app, "Roadside Picnic");

    let req = test::TestRequest::post()
        .uri("/api/v1/users")
        .insert_header(bearer!(&admin))
        .set_json(&serde_json::json!({"username":"zoner","email":"zoner@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .insert_header(bearer!(token_for(6, "zoner")))
        .set_json(&serde_json::json!({"text":"zone","score":9}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::delete()
        .uri("/api/v1/users/zoner")
        .insert_header(bearer!(&admin))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}/reviews"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["count"], 0);

    // the title's rating is back to null, not a division fault
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/titles/{title_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let title: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(title["rating"].is_null());
}
