use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::Role;

pub type Id = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub bio: String,
    pub role: Role,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    pub confirmation_code: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.is_staff || self.role == Role::Admin || self.is_superuser
    }

    pub fn is_moderator(&self) -> bool {
        self.role == Role::Moderator
    }
}

/// Public projection of a user; id, flags and the confirmation code stay internal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserOut {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub bio: String,
    pub role: Role,
}

impl From<&User> for UserOut {
    fn from(u: &User) -> Self {
        Self {
            username: u.username.clone(),
            email: u.email.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            bio: u.bio.clone(),
            role: u.role,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateUser {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignUp {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub username: String,
    pub confirmation_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Category {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCategory {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Genre {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewGenre {
    pub name: String,
    pub slug: String,
}

/// Read model of a title. `rating` is recomputed from review scores on every
/// read; it is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Title {
    pub id: Id,
    pub name: String,
    pub year: i32,
    pub rating: Option<f64>,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub genre: Vec<Genre>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTitle {
    pub name: String,
    pub year: i32,
    pub description: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub genre: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateTitle {
    pub name: Option<String>,
    pub year: Option<i32>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub genre: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Review {
    pub id: Id,
    pub title_id: Id,
    pub author: String,
    pub text: String,
    pub score: i32,
    pub pub_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewReview {
    pub text: String,
    pub score: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateReview {
    pub text: Option<String>,
    pub score: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Comment {
    pub id: Id,
    pub review_id: Id,
    pub author: String,
    pub text: String,
    pub pub_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewComment {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateComment {
    pub text: Option<String>,
}

/// Limit/offset slice requested by a listing endpoint. A missing limit means
/// everything after the offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: i64,
}

/// Listing envelope: total matching count plus the requested slice.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(
    UserPage = Page<UserOut>,
    CategoryPage = Page<Category>,
    GenrePage = Page<Genre>,
    TitlePage = Page<Title>,
    ReviewPage = Page<Review>,
    CommentPage = Page<Comment>
)]
pub struct Page<T> {
    pub count: i64,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            count: self.count,
            results: self.results.into_iter().map(f).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct SearchQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

impl SearchQuery {
    pub fn page(&self) -> PageParams {
        PageParams { limit: self.limit, offset: self.offset }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct PageQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

impl PageQuery {
    pub fn page(&self) -> PageParams {
        PageParams { limit: self.limit, offset: self.offset }
    }
}

/// Filter set accepted by the title listing endpoint.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct TitleQuery {
    pub category: Option<String>,
    pub genre: Option<String>,
    pub name: Option<String>,
    pub year: Option<i32>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

impl TitleQuery {
    pub fn page(&self) -> PageParams {
        PageParams { limit: self.limit, offset: self.offset }
    }

    pub fn filter(&self) -> TitleFilter {
        TitleFilter {
            category: self.category.clone(),
            genre: self.genre.clone(),
            name: self.name.clone(),
            year: self.year,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TitleFilter {
    pub category: Option<String>,
    pub genre: Option<String>,
    pub name: Option<String>,
    pub year: Option<i32>,
}
