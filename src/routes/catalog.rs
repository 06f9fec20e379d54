use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::{
    Category, CategoryPage, Genre, GenrePage, Id, NewCategory, NewGenre, NewTitle, SearchQuery,
    Title, TitlePage, TitleQuery, UpdateTitle,
};
use crate::permissions::{enforce, AdminOrReadOnly};
use crate::validate;

use super::AppState;

async fn check_title_refs(
    data: &AppState,
    category: Option<&str>,
    genres: &[String],
) -> Result<(), ApiError> {
    if let Some(slug) = category {
        if !data.repo.category_exists(slug).await? {
            return Err(ApiError::Validation(format!("unknown category slug '{slug}'")));
        }
    }
    for slug in genres {
        if !data.repo.genre_exists(slug).await? {
            return Err(ApiError::Validation(format!("unknown genre slug '{slug}'")));
        }
    }
    Ok(())
}

// ---------------- categories ----------------

#[utoipa::path(
    get,
    path = "/api/v1/categories",
    params(SearchQuery),
    responses((status = 200, description = "List categories", body = CategoryPage))
)]
pub async fn list_categories(
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = data
        .repo
        .list_categories(query.search.as_deref(), query.page())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/categories",
    request_body = NewCategory,
    responses(
        (status = 201, description = "Category created", body = Category),
        (status = 403, description = "Admins only"),
        (status = 409, description = "Slug already taken")
    )
)]
pub async fn create_category(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewCategory>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    validate::validate_name(&payload.name)?;
    validate::validate_slug(&payload.slug)?;
    let category = data.repo.create_category(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(category))
}

#[utoipa::path(
    delete,
    path = "/api/v1/categories/{slug}",
    params(("slug" = String, Path, description = "Category slug")),
    responses(
        (status = 204, description = "Category deleted; titles keep existing with category = null"),
        (status = 403, description = "Admins only"),
        (status = 404, description = "Category not found")
    )
)]
pub async fn delete_category(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    data.repo.delete_category(&path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- genres ----------------

#[utoipa::path(
    get,
    path = "/api/v1/genres",
    params(SearchQuery),
    responses((status = 200, description = "List genres", body = GenrePage))
)]
pub async fn list_genres(
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = data
        .repo
        .list_genres(query.search.as_deref(), query.page())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/genres",
    request_body = NewGenre,
    responses(
        (status = 201, description = "Genre created", body = Genre),
        (status = 403, description = "Admins only"),
        (status = 409, description = "Slug already taken")
    )
)]
pub async fn create_genre(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewGenre>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    validate::validate_name(&payload.name)?;
    validate::validate_slug(&payload.slug)?;
    let genre = data.repo.create_genre(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(genre))
}

#[utoipa::path(
    delete,
    path = "/api/v1/genres/{slug}",
    params(("slug" = String, Path, description = "Genre slug")),
    responses(
        (status = 204, description = "Genre deleted"),
        (status = 403, description = "Admins only"),
        (status = 404, description = "Genre not found")
    )
)]
pub async fn delete_genre(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    data.repo.delete_genre(&path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- titles ----------------

#[utoipa::path(
    get,
    path = "/api/v1/titles",
    params(TitleQuery),
    responses((status = 200, description = "List titles with derived ratings", body = TitlePage))
)]
pub async fn list_titles(
    data: web::Data<AppState>,
    query: web::Query<TitleQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = data.repo.list_titles(query.filter(), query.page()).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/titles",
    request_body = NewTitle,
    responses(
        (status = 201, description = "Title created", body = Title),
        (status = 400, description = "Validation failure (year in the future, unknown slug, ...)"),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Admins only")
    )
)]
pub async fn create_title(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewTitle>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    let new = payload.into_inner();
    validate::validate_name(&new.name)?;
    validate::validate_year(new.year)?;
    if let Some(ref description) = new.description {
        validate::validate_description(description)?;
    }
    check_title_refs(&data, new.category.as_deref(), &new.genre).await?;
    let title = data.repo.create_title(new).await?;
    Ok(HttpResponse::Created().json(title))
}

#[utoipa::path(
    get,
    path = "/api/v1/titles/{id}",
    params(("id" = Id, Path, description = "Title id")),
    responses(
        (status = 200, description = "Title", body = Title),
        (status = 404, description = "Title not found")
    )
)]
pub async fn get_title(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let title = data.repo.get_title(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(title))
}

#[utoipa::path(
    patch,
    path = "/api/v1/titles/{id}",
    request_body = UpdateTitle,
    params(("id" = Id, Path, description = "Title id")),
    responses(
        (status = 200, description = "Title updated", body = Title),
        (status = 400, description = "Validation failure"),
        (status = 403, description = "Admins only"),
        (status = 404, description = "Title not found")
    )
)]
pub async fn patch_title(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateTitle>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    let upd = payload.into_inner();
    if let Some(ref name) = upd.name {
        validate::validate_name(name)?;
    }
    if let Some(year) = upd.year {
        validate::validate_year(year)?;
    }
    if let Some(ref description) = upd.description {
        validate::validate_description(description)?;
    }
    check_title_refs(
        &data,
        upd.category.as_deref(),
        upd.genre.as_deref().unwrap_or(&[]),
    )
    .await?;
    let title = data.repo.update_title(path.into_inner(), upd).await?;
    Ok(HttpResponse::Ok().json(title))
}

#[utoipa::path(
    delete,
    path = "/api/v1/titles/{id}",
    params(("id" = Id, Path, description = "Title id")),
    responses(
        (status = 204, description = "Title deleted; its reviews and their comments are removed"),
        (status = 403, description = "Admins only"),
        (status = 404, description = "Title not found")
    )
)]
pub async fn delete_title(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    enforce(&AdminOrReadOnly, Some(&auth.0), req.method())?;
    data.repo.delete_title(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
