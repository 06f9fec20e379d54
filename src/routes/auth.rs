use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth;
use crate::error::ApiError;
use crate::models::{NewUser, SignUp, TokenRequest, TokenResponse, UserOut};
use crate::validate;

use super::{client_ip, AppState};

#[utoipa::path(
    post,
    path = "/api/v1/auth/signup",
    request_body = SignUp,
    responses(
        (status = 200, description = "Confirmation code issued (idempotent for an exact pair match)", body = UserOut),
        (status = 400, description = "Invalid username/email, or one of them already belongs to a different account"),
        (status = 429, description = "Too many sign-up attempts")
    )
)]
pub async fn signup(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<SignUp>,
) -> Result<HttpResponse, ApiError> {
    if !data.limits.allow_signup(&client_ip(&req)) {
        return Err(ApiError::RateLimited);
    }
    let SignUp { username, email } = payload.into_inner();
    validate::validate_username(&username)?;
    validate::validate_email(&email)?;

    // Exact pair match is idempotent; a collision on either field alone is an
    // error, since both are globally unique.
    let user = match data.repo.find_user_pair(&username, &email).await? {
        Some(existing) => existing,
        None => {
            if data.repo.username_taken(&username).await? || data.repo.email_taken(&email).await? {
                return Err(ApiError::Validation(
                    "username or email is already in use".to_string(),
                ));
            }
            data.repo
                .create_user(NewUser { username, email, ..NewUser::default() })
                .await?
        }
    };

    let code = auth::issue_confirmation_code(&user);
    data.repo.set_confirmation_code(&user.username, &code).await?;
    data.mailer
        .send(
            &user.email,
            "Confirmation code",
            &format!("Your confirmation code: {code}"),
        )
        .await?;
    metrics::increment_counter!("crit_signups_total");
    Ok(HttpResponse::Ok().json(UserOut::from(&user)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/token",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Bearer token issued", body = TokenResponse),
        (status = 400, description = "Confirmation code mismatch"),
        (status = 404, description = "Unknown username"),
        (status = 429, description = "Too many token attempts")
    )
)]
pub async fn token(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<TokenRequest>,
) -> Result<HttpResponse, ApiError> {
    if !data.limits.allow_token(&client_ip(&req)) {
        return Err(ApiError::RateLimited);
    }
    let user = data.repo.get_user(&payload.username).await?;
    if !auth::verify_confirmation_code(&user, &payload.confirmation_code) {
        return Err(ApiError::Validation("invalid confirmation code".to_string()));
    }
    let token = auth::create_jwt(user.id, &user.username, auth::effective_roles(&user))
        .map_err(|_| ApiError::Internal)?;
    metrics::increment_counter!("crit_tokens_issued_total");
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}
