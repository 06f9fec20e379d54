use std::sync::Arc;

use actix_web::{web, HttpRequest};

use crate::mail::Mailer;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;

pub mod auth;
pub mod catalog;
pub mod reviews;
pub mod users;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub mailer: Arc<dyn Mailer>,
    pub limits: RateLimiterFacade,
}

pub(crate) fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/auth/signup").route(web::post().to(auth::signup)))
            .service(web::resource("/auth/token").route(web::post().to(auth::token)))
            // "/users/me" must register ahead of "/users/{username}"
            .service(
                web::resource("/users/me")
                    .route(web::get().to(users::me))
                    .route(web::patch().to(users::patch_me)),
            )
            .service(
                web::resource("/users")
                    .route(web::get().to(users::list_users))
                    .route(web::post().to(users::create_user)),
            )
            .service(
                web::resource("/users/{username}")
                    .route(web::get().to(users::get_user))
                    .route(web::patch().to(users::patch_user))
                    .route(web::delete().to(users::delete_user)),
            )
            .service(
                web::resource("/categories")
                    .route(web::get().to(catalog::list_categories))
                    .route(web::post().to(catalog::create_category)),
            )
            .service(
                web::resource("/categories/{slug}")
                    .route(web::delete().to(catalog::delete_category)),
            )
            .service(
                web::resource("/genres")
                    .route(web::get().to(catalog::list_genres))
                    .route(web::post().to(catalog::create_genre)),
            )
            .service(
                web::resource("/genres/{slug}").route(web::delete().to(catalog::delete_genre)),
            )
            .service(
                web::resource("/titles")
                    .route(web::get().to(catalog::list_titles))
                    .route(web::post().to(catalog::create_title)),
            )
            .service(
                web::resource("/titles/{id}")
                    .route(web::get().to(catalog::get_title))
                    .route(web::patch().to(catalog::patch_title))
                    .route(web::delete().to(catalog::delete_title)),
            )
            .service(
                web::resource("/titles/{title_id}/reviews")
                    .route(web::get().to(reviews::list_reviews))
                    .route(web::post().to(reviews::create_review)),
            )
            .service(
                web::resource("/titles/{title_id}/reviews/{id}")
                    .route(web::get().to(reviews::get_review))
                    .route(web::patch().to(reviews::patch_review))
                    .route(web::delete().to(reviews::delete_review)),
            )
            .service(
                web::resource("/titles/{title_id}/reviews/{review_id}/comments")
                    .route(web::get().to(reviews::list_comments))
                    .route(web::post().to(reviews::create_comment)),
            )
            .service(
                web::resource("/titles/{title_id}/reviews/{review_id}/comments/{id}")
                    .route(web::get().to(reviews::get_comment))
                    .route(web::patch().to(reviews::patch_comment))
                    .route(web::delete().to(reviews::delete_comment)),
            ),
    );
}
