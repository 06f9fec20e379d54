use actix_web::http::Method;

use crate::auth::{Claims, Role};
use crate::error::ApiError;

/// Read-only methods pass every coarse check, anonymous callers included.
pub fn is_safe(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

pub fn is_admin(claims: &Claims) -> bool {
    claims.roles.iter().any(|r| matches!(r, Role::Admin))
}

pub fn is_moderator(claims: &Claims) -> bool {
    claims.roles.iter().any(|r| matches!(r, Role::Moderator))
}

/// Two-level permission contract: every mutating request is evaluated once
/// against the endpoint class and, where an owned object is involved, once
/// more against the specific instance.
pub trait Policy {
    fn allows_request(&self, actor: Option<&Claims>, method: &Method) -> bool;

    fn allows_on_resource(&self, actor: Option<&Claims>, method: &Method, _owner: &str) -> bool {
        self.allows_request(actor, method)
    }
}

/// User administration: admin for every method, reads included.
pub struct AdminOnly;

impl Policy for AdminOnly {
    fn allows_request(&self, actor: Option<&Claims>, _method: &Method) -> bool {
        actor.map(is_admin).unwrap_or(false)
    }
}

/// Catalog resources: anyone may read, only admins may mutate.
pub struct AdminOrReadOnly;

impl Policy for AdminOrReadOnly {
    fn allows_request(&self, actor: Option<&Claims>, method: &Method) -> bool {
        is_safe(method) || actor.map(is_admin).unwrap_or(false)
    }
}

/// Reviews and comments: any authenticated user may create; editing or
/// deleting a specific object takes the author, a moderator, or an admin.
pub struct AuthorOrStaffOrReadOnly;

impl Policy for AuthorOrStaffOrReadOnly {
    fn allows_request(&self, actor: Option<&Claims>, method: &Method) -> bool {
        is_safe(method) || actor.is_some()
    }

    fn allows_on_resource(&self, actor: Option<&Claims>, method: &Method, owner: &str) -> bool {
        if is_safe(method) {
            return true;
        }
        match actor {
            Some(claims) => {
                is_admin(claims) || is_moderator(claims) || claims.username() == owner
            }
            None => false,
        }
    }
}

/// Coarse check. Anonymous denial is 401, authenticated denial is 403.
pub fn enforce(
    policy: &dyn Policy,
    actor: Option<&Claims>,
    method: &Method,
) -> Result<(), ApiError> {
    if policy.allows_request(actor, method) {
        Ok(())
    } else if actor.is_none() {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Fine (per-object) check, same denial mapping.
pub fn enforce_object(
    policy: &dyn Policy,
    actor: Option<&Claims>,
    method: &Method,
    owner: &str,
) -> Result<(), ApiError> {
    if policy.allows_on_resource(actor, method, owner) {
        Ok(())
    } else if actor.is_none() {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(roles: Vec<Role>) -> Claims {
        Claims { sub: "7:alice".into(), exp: usize::MAX, roles }
    }

    #[test]
    fn safe_methods_open_to_anonymous() {
        assert!(AdminOrReadOnly.allows_request(None, &Method::GET));
        assert!(AuthorOrStaffOrReadOnly.allows_request(None, &Method::GET));
        // user administration is closed even for reads
        assert!(!AdminOnly.allows_request(None, &Method::GET));
    }

    #[test]
    fn catalog_mutation_needs_admin() {
        let user = claims(vec![Role::User]);
        let admin = claims(vec![Role::Admin]);
        assert!(!AdminOrReadOnly.allows_request(None, &Method::POST));
        assert!(!AdminOrReadOnly.allows_request(Some(&user), &Method::POST));
        assert!(AdminOrReadOnly.allows_request(Some(&admin), &Method::POST));
    }

    #[test]
    fn object_check_takes_author_or_privileged() {
        let policy = AuthorOrStaffOrReadOnly;
        let author = claims(vec![Role::User]);
        let outsider = Claims { sub: "9:bob".into(), exp: usize::MAX, roles: vec![Role::User] };
        let moderator = Claims { sub: "3:mod".into(), exp: usize::MAX, roles: vec![Role::Moderator] };

        assert!(policy.allows_on_resource(Some(&author), &Method::DELETE, "alice"));
        assert!(!policy.allows_on_resource(Some(&outsider), &Method::DELETE, "alice"));
        assert!(policy.allows_on_resource(Some(&moderator), &Method::DELETE, "alice"));
        // passing the coarse check does not imply the fine one
        assert!(policy.allows_request(Some(&outsider), &Method::DELETE));
    }

    #[test]
    fn denial_maps_401_for_anonymous_403_for_authenticated() {
        let user = claims(vec![Role::User]);
        assert!(matches!(
            enforce(&AdminOrReadOnly, None, &Method::POST),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            enforce(&AdminOrReadOnly, Some(&user), &Method::POST),
            Err(ApiError::Forbidden)
        ));
    }
}
