#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App, HttpResponse};
use crit::mail::{Mailer, MemoryMailer};
use crit::rate_limit::RateLimiterFacade;
use crit::repo::inmem::InMemRepo;
use crit::{config, AppState, SecurityHeaders};
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

#[actix_web::test]
#[serial_test::serial]
async fn security_headers_present() {
    setup_env();
    std::env::remove_var("ENABLE_HSTS");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/v1/categories").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let headers = resp.headers();
    assert!(headers.get("content-security-policy").is_some());
    assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert!(headers.get("strict-transport-security").is_none()); // not enabled
}

#[actix_web::test]
#[serial_test::serial]
async fn hsts_enabled_via_builder() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env().with_hsts(true))
            .app_data(actix_web::web::Data::new(app_state()))
            .configure(config),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/v1/genres").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert!(resp.headers().get("strict-transport-security").is_some(), "HSTS header missing");
}

#[actix_web::test]
#[serial_test::serial]
async fn existing_csp_header_preserved() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .route("/custom", web::get().to(|| async {
                HttpResponse::Ok()
                    .insert_header((actix_web::http::header::CONTENT_SECURITY_POLICY, "custom-src 'none'"))
                    .finish()
            })),
    )
    .await;
    let req = test::TestRequest::get().uri("/custom").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let csp = resp.headers().get("content-security-policy").unwrap().to_str().unwrap();
    assert_eq!(csp, "custom-src 'none'");
}
