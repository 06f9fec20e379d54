use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::future::{ready, Ready};
use std::str::FromStr;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::{Id, User};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub roles: Vec<Role>,
}

impl Claims {
    /// Subject shape is "{id}:{username}".
    pub fn username(&self) -> &str {
        self.sub
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(self.sub.as_str())
    }
}

/// Validate a JWT and return its claims.
fn decode_jwt(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let secret = env::var("JWT_SECRET").expect("JWT_SECRET not set");
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Extractor yielding validated `Claims`.
pub struct Auth(pub Claims);

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        // Delegate to BearerAuth to parse the header.
        if let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() {
            match decode_jwt(bearer.token()) {
                Ok(claims) => return ready(Ok(Auth(claims))),
                Err(_) => return ready(Err(ApiError::Unauthorized.into())),
            }
        }
        ready(Err(ApiError::Unauthorized.into()))
    }
}

/// Create a JWT for a verified user.
pub fn create_jwt(
    user_id: Id,
    username: &str,
    roles: Vec<Role>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let secret = env::var("JWT_SECRET").expect("JWT_SECRET not set");
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: format!("{user_id}:{username}"),
        exp: expiration,
        roles,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Expand a user record into the role claims carried by its tokens.
/// Staff and superuser flags grant admin on top of the stored role.
pub fn effective_roles(user: &User) -> Vec<Role> {
    let mut roles = vec![user.role];
    if user.is_admin() && user.role != Role::Admin {
        roles.push(Role::Admin);
    }
    roles
}

/// Confirmation code sent to a registering email: SHA-256 over the user's
/// identity plus a fresh random nonce, hex-truncated to 40 chars. A new code
/// replaces the previous one on every sign-up request.
pub fn issue_confirmation_code(user: &User) -> String {
    let mut nonce = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut hasher = Sha256::new();
    hasher.update(user.id.to_le_bytes());
    hasher.update(user.username.as_bytes());
    hasher.update(nonce);
    let digest = hex::encode(hasher.finalize());
    digest[..40].to_string()
}

pub fn verify_confirmation_code(user: &User, supplied: &str) -> bool {
    !supplied.is_empty() && user.confirmation_code.as_deref() == Some(supplied)
}
