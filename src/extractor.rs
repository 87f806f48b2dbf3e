use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    org: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Claims of a bearer token whose signature and expiry checked out.
#[derive(Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: String,
    pub role: String,
    pub org: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|authz| authz.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Checks `token` against `JWT_SECRET`.
pub fn verify_token(token: &str) -> Option<VerifiedToken> {
    let secret = crate::config::JWT_SECRET.as_str();
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some(VerifiedToken {
        subject: decoded.claims.sub,
        role: decoded.claims.role,
        org: decoded.claims.org.filter(|org| !org.trim().is_empty()),
    })
}

/// key: admin-auth
/// Operator identity for admin routes. Only tokens carrying the admin role are accepted; the
/// subject is recorded as the actor on audited operations.
pub struct AdminUser {
    pub subject: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let verified =
            verify_token(token).ok_or((StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        if verified.role != ADMIN_ROLE {
            return Err((StatusCode::FORBIDDEN, "Admin role required".into()));
        }
        Ok(AdminUser {
            subject: verified.subject,
        })
    }
}
