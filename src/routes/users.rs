use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::{NewUser, SearchQuery, UpdateUser, UserOut, UserPage};
use crate::permissions::{enforce, AdminOnly};
use crate::validate;

use super::AppState;

#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(SearchQuery),
    responses(
        (status = 200, description = "List users", body = UserPage),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Admins only")
    )
)]
pub async fn list_users(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOnly, Some(&auth.0), req.method())?;
    let page = data
        .repo
        .list_users(query.search.as_deref(), query.page())
        .await?
        .map(|u| UserOut::from(&u));
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = NewUser,
    responses(
        (status = 201, description = "User created (or already present with the exact same pair)", body = UserOut),
        (status = 400, description = "Validation failure or partial collision"),
        (status = 403, description = "Admins only")
    )
)]
pub async fn create_user(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOnly, Some(&auth.0), req.method())?;
    let new = payload.into_inner();
    validate::validate_username(&new.username)?;
    validate::validate_email(&new.email)?;
    // same pair rules as sign-up
    let user = match data.repo.find_user_pair(&new.username, &new.email).await? {
        Some(existing) => existing,
        None => {
            if data.repo.username_taken(&new.username).await?
                || data.repo.email_taken(&new.email).await?
            {
                return Err(ApiError::Validation(
                    "username or email is already in use".to_string(),
                ));
            }
            data.repo.create_user(new).await?
        }
    };
    Ok(HttpResponse::Created().json(UserOut::from(&user)))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/me",
    responses(
        (status = 200, description = "Caller's own record", body = UserOut),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(auth.0.username()).await?;
    Ok(HttpResponse::Ok().json(UserOut::from(&user)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/users/me",
    request_body = UpdateUser,
    responses(
        (status = 200, description = "Updated record; the role field is pinned to the stored role", body = UserOut),
        (status = 401, description = "Authentication required")
    )
)]
pub async fn patch_me(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<UpdateUser>,
) -> Result<HttpResponse, ApiError> {
    let mut upd = payload.into_inner();
    if let Some(ref email) = upd.email {
        validate::validate_email(email)?;
    }
    // no privilege self-escalation, whatever the payload says
    upd.role = None;
    let user = data.repo.update_user(auth.0.username(), upd).await?;
    Ok(HttpResponse::Ok().json(UserOut::from(&user)))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "Username")),
    responses(
        (status = 200, description = "User", body = UserOut),
        (status = 403, description = "Admins only"),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_user(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOnly, Some(&auth.0), req.method())?;
    let user = data.repo.get_user(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(UserOut::from(&user)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/users/{username}",
    request_body = UpdateUser,
    params(("username" = String, Path, description = "Username")),
    responses(
        (status = 200, description = "User updated", body = UserOut),
        (status = 403, description = "Admins only"),
        (status = 404, description = "User not found")
    )
)]
pub async fn patch_user(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUser>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOnly, Some(&auth.0), req.method())?;
    let upd = payload.into_inner();
    if let Some(ref email) = upd.email {
        validate::validate_email(email)?;
    }
    let user = data.repo.update_user(&path.into_inner(), upd).await?;
    Ok(HttpResponse::Ok().json(UserOut::from(&user)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "Username")),
    responses(
        (status = 204, description = "User deleted; their reviews and comments go with them"),
        (status = 403, description = "Admins only"),
        (status = 404, description = "User not found")
    )
)]
pub async fn delete_user(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOnly, Some(&auth.0), req.method())?;
    data.repo.delete_user(&path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
