use crate::auth::Role;
use crate::models::{
    Category, CategoryPage, Comment, CommentPage, Genre, GenrePage, NewCategory, NewComment,
    NewGenre, NewReview, NewTitle, NewUser, Review, ReviewPage, SignUp, Title, TitlePage,
    TokenRequest, TokenResponse, UpdateComment, UpdateReview, UpdateTitle, UpdateUser, UserOut,
    UserPage,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::auth::signup,
        crate::routes::auth::token,
        crate::routes::users::list_users,
        crate::routes::users::create_user,
        crate::routes::users::me,
        crate::routes::users::patch_me,
        crate::routes::users::get_user,
        crate::routes::users::patch_user,
        crate::routes::users::delete_user,
        crate::routes::catalog::list_categories,
        crate::routes::catalog::create_category,
        crate::routes::catalog::delete_category,
        crate::routes::catalog::list_genres,
        crate::routes::catalog::create_genre,
        crate::routes::catalog::delete_genre,
        crate::routes::catalog::list_titles,
        crate::routes::catalog::create_title,
        crate::routes::catalog::get_title,
        crate::routes::catalog::patch_title,
        crate::routes::catalog::delete_title,
        crate::routes::reviews::list_reviews,
        crate::routes::reviews::create_review,
        crate::routes::reviews::get_review,
        crate::routes::reviews::patch_review,
        crate::routes::reviews::delete_review,
        crate::routes::reviews::list_comments,
        crate::routes::reviews::create_comment,
        crate::routes::reviews::get_comment,
        crate::routes::reviews::patch_comment,
        crate::routes::reviews::delete_comment,
    ),
    components(schemas(
        Role, SignUp, TokenRequest, TokenResponse,
        UserOut, NewUser, UpdateUser, UserPage,
        Category, NewCategory, CategoryPage,
        Genre, NewGenre, GenrePage,
        Title, NewTitle, UpdateTitle, TitlePage,
        Review, NewReview, UpdateReview, ReviewPage,
        Comment, NewComment, UpdateComment, CommentPage
    )),
    tags(
        (name = "auth", description = "Sign-up and token issuance"),
        (name = "users", description = "User administration and self-profile"),
        (name = "catalog", description = "Categories, genres and titles"),
        (name = "reviews", description = "Reviews and comments"),
    )
)]
pub struct ApiDoc;
