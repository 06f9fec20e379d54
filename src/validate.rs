use std::collections::{BTreeSet, HashSet};

use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;

use crate::error::ApiError;

pub const MAX_USERNAME_LEN: usize = 150;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 255;
pub const MAX_SLUG_LEN: usize = 50;

/// "me" is routed to the self-profile endpoint and can never be a username.
const RESERVED_USERNAME: &str = "me";

static USERNAME_CHARS: Lazy<HashSet<char>> = Lazy::new(|| {
    ('a'..='z')
        .chain('A'..='Z')
        .chain('0'..='9')
        .chain(".@+-_".chars())
        .collect()
});

pub fn validate_username(value: &str) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > MAX_USERNAME_LEN {
        return Err(ApiError::Validation(format!(
            "username must be 1-{MAX_USERNAME_LEN} characters"
        )));
    }
    if value == RESERVED_USERNAME {
        return Err(ApiError::Validation(
            "username 'me' is reserved".to_string(),
        ));
    }
    let invalid: BTreeSet<char> = value
        .chars()
        .filter(|c| !USERNAME_CHARS.contains(c))
        .collect();
    if !invalid.is_empty() {
        let listed = invalid
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        return Err(ApiError::Validation(format!(
            "invalid characters in username: {listed}"
        )));
    }
    Ok(())
}

/// Structural email check; full RFC compliance is the mail relay's problem.
pub fn validate_email(value: &str) -> Result<(), ApiError> {
    let malformed = || ApiError::Validation(format!("'{value}' is not a valid email address"));
    if value.is_empty() || value.len() > MAX_EMAIL_LEN {
        return Err(malformed());
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(malformed());
    }
    let (local, domain) = value.rsplit_once('@').ok_or_else(malformed)?;
    if local.is_empty()
        || domain.is_empty()
        || local.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(malformed());
    }
    Ok(())
}

pub fn validate_year(value: i32) -> Result<(), ApiError> {
    let current = Utc::now().year();
    if value > current {
        return Err(ApiError::Validation(format!(
            "{value} cannot be greater than {current}"
        )));
    }
    Ok(())
}

pub fn validate_score(value: i32) -> Result<(), ApiError> {
    if !(1..=10).contains(&value) {
        return Err(ApiError::Validation(
            "score must be between 1 and 10".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_slug(value: &str) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > MAX_SLUG_LEN {
        return Err(ApiError::Validation(format!(
            "slug must be 1-{MAX_SLUG_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::Validation(format!("'{value}' is not a valid slug")));
    }
    Ok(())
}

pub fn validate_name(value: &str) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(ApiError::Validation(format!(
            "name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_description(value: &str) -> Result<(), ApiError> {
    if value.len() > MAX_DESCRIPTION_LEN {
        return Err(ApiError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}
