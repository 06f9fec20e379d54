use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::{
    Comment, CommentPage, Id, NewComment, NewReview, PageQuery, Review, ReviewPage, UpdateComment,
    UpdateReview,
};
use crate::permissions::{enforce, enforce_object, AuthorOrStaffOrReadOnly};
use crate::validate;

use super::AppState;

// ---------------- reviews ----------------

#[utoipa::path(
    get,
    path = "/api/v1/titles/{title_id}/reviews",
    params(("title_id" = Id, Path, description = "Title id"), PageQuery),
    responses(
        (status = 200, description = "Reviews, newest first", body = ReviewPage),
        (status = 404, description = "Title not found")
    )
)]
pub async fn list_reviews(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let title_id = path.into_inner();
    data.repo.get_title(title_id).await?;
    let page = data.repo.list_reviews(title_id, query.page()).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/titles/{title_id}/reviews",
    request_body = NewReview,
    params(("title_id" = Id, Path, description = "Title id")),
    responses(
        (status = 201, description = "Review created", body = Review),
        (status = 400, description = "Score out of range or a second review for the same title"),
        (status = 401, description = "Authentication required"),
        (status = 404, description = "Title not found")
    )
)]
pub async fn create_review(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewReview>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let title_id = path.into_inner();
    data.repo.get_title(title_id).await?;
    let new = payload.into_inner();
    validate::validate_score(new.score)?;
    let author = auth.0.username();
    // fast-path courtesy check; the store constraint is the real guard
    if data.repo.find_review(title_id, author).await?.is_some() {
        return Err(ApiError::Validation(
            "you have already reviewed this title".to_string(),
        ));
    }
    let review = data.repo.create_review(title_id, author, new).await?;
    metrics::increment_counter!("crit_reviews_created_total");
    Ok(HttpResponse::Created().json(review))
}

#[utoipa::path(
    get,
    path = "/api/v1/titles/{title_id}/reviews/{id}",
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("id" = Id, Path, description = "Review id")
    ),
    responses(
        (status = 200, description = "Review", body = Review),
        (status = 404, description = "Review not found under this title")
    )
)]
pub async fn get_review(
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (title_id, id) = path.into_inner();
    let review = data.repo.get_review(title_id, id).await?;
    Ok(HttpResponse::Ok().json(review))
}

#[utoipa::path(
    patch,
    path = "/api/v1/titles/{title_id}/reviews/{id}",
    request_body = UpdateReview,
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("id" = Id, Path, description = "Review id")
    ),
    responses(
        (status = 200, description = "Review updated", body = Review),
        (status = 403, description = "Not the author, a moderator, or an admin"),
        (status = 404, description = "Review not found under this title")
    )
)]
pub async fn patch_review(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    payload: web::Json<UpdateReview>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let (title_id, id) = path.into_inner();
    let review = data.repo.get_review(title_id, id).await?;
    enforce_object(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method(), &review.author)?;
    let upd = payload.into_inner();
    if let Some(score) = upd.score {
        validate::validate_score(score)?;
    }
    let review = data.repo.update_review(title_id, id, upd).await?;
    Ok(HttpResponse::Ok().json(review))
}

#[utoipa::path(
    delete,
    path = "/api/v1/titles/{title_id}/reviews/{id}",
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("id" = Id, Path, description = "Review id")
    ),
    responses(
        (status = 204, description = "Review deleted together with its comments"),
        (status = 403, description = "Not the author, a moderator, or an admin"),
        (status = 404, description = "Review not found under this title")
    )
)]
pub async fn delete_review(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let (title_id, id) = path.into_inner();
    let review = data.repo.get_review(title_id, id).await?;
    enforce_object(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method(), &review.author)?;
    data.repo.delete_review(title_id, id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- comments ----------------

#[utoipa::path(
    get,
    path = "/api/v1/titles/{title_id}/reviews/{review_id}/comments",
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("review_id" = Id, Path, description = "Review id"),
        PageQuery
    ),
    responses(
        (status = 200, description = "Comments, newest first", body = CommentPage),
        (status = 404, description = "Review not found under this title")
    )
)]
pub async fn list_comments(
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let (title_id, review_id) = path.into_inner();
    data.repo.get_review(title_id, review_id).await?;
    let page = data.repo.list_comments(review_id, query.page()).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/titles/{title_id}/reviews/{review_id}/comments",
    request_body = NewComment,
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("review_id" = Id, Path, description = "Review id")
    ),
    responses(
        (status = 201, description = "Comment created", body = Comment),
        (status = 401, description = "Authentication required"),
        (status = 404, description = "Review not found under this title")
    )
)]
pub async fn create_comment(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    payload: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let (title_id, review_id) = path.into_inner();
    data.repo.get_review(title_id, review_id).await?;
    let comment = data
        .repo
        .create_comment(review_id, auth.0.username(), payload.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(comment))
}

#[utoipa::path(
    get,
    path = "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{id}",
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("review_id" = Id, Path, description = "Review id"),
        ("id" = Id, Path, description = "Comment id")
    ),
    responses(
        (status = 200, description = "Comment", body = Comment),
        (status = 404, description = "Comment not found under this review")
    )
)]
pub async fn get_comment(
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (title_id, review_id, id) = path.into_inner();
    data.repo.get_review(title_id, review_id).await?;
    let comment = data.repo.get_comment(review_id, id).await?;
    Ok(HttpResponse::Ok().json(comment))
}

#[utoipa::path(
    patch,
    path = "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{id}",
    request_body = UpdateComment,
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("review_id" = Id, Path, description = "Review id"),
        ("id" = Id, Path, description = "Comment id")
    ),
    responses(
        (status = 200, description = "Comment updated", body = Comment),
        (status = 403, description = "Not the author, a moderator, or an admin"),
        (status = 404, description = "Comment not found under this review")
    )
)]
pub async fn patch_comment(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
    payload: web::Json<UpdateComment>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let (title_id, review_id, id) = path.into_inner();
    data.repo.get_review(title_id, review_id).await?;
    let comment = data.repo.get_comment(review_id, id).await?;
    enforce_object(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method(), &comment.author)?;
    let comment = data
        .repo
        .update_comment(review_id, id, payload.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(comment))
}

#[utoipa::path(
    delete,
    path = "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{id}",
    params(
        ("title_id" = Id, Path, description = "Title id"),
        ("review_id" = Id, Path, description = "Review id"),
        ("id" = Id, Path, description = "Comment id")
    ),
    responses(
        (status = 204, description = "Comment deleted"),
        (status = 403, description = "Not the author, a moderator, or an admin"),
        (status = 404, description = "Comment not found under this review")
    )
)]
pub async fn delete_comment(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method())?;
    let (title_id, review_id, id) = path.into_inner();
    data.repo.get_review(title_id, review_id).await?;
    let comment = data.repo.get_comment(review_id, id).await?;
    enforce_object(&AuthorOrStaffOrReadOnly, Some(&auth.0), req.method(), &comment.author)?;
    data.repo.delete_comment(review_id, id).await?;
    Ok(HttpResponse::NoContent().finish())
}
