#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, Claims};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

/// Verifies an HS256 token. `exp` is checked when present but not required.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.remove("exp");

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Validates the request's bearer credential
pub fn authenticate(headers: &HeaderMap, secret: &str) -> Result<Claims, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    validate_token(token, secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    fn now() -> usize {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as usize
    }

    fn token(user_id: &str, exp: usize, secret: &str) -> String {
        sign(user_id, Some(exp), secret)
    }

    fn sign(user_id: &str, exp: Option<usize>, secret: &str) -> String {
        let claims = Claims {
            user_id: user_id.to_string(),
            email: Some("alice@example.com".to_string()),
            iat: Some(now()),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_valid_token() {
        let claims = validate_token(&token("user-123", now() + 900, SECRET), SECRET).unwrap();
        assert_eq!(claims.user_id, "user-123");
        assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_invalid_secret_rejects() {
        let result = validate_token(&token("user-123", now() + 900, "secret-1"), "secret-2");
        assert_eq!(result.unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn test_expired_token_rejects() {
        let result = validate_token(&token("user-123", now() - 3600, SECRET), SECRET);
        assert_eq!(result.unwrap_err(), AuthError::TokenExpired);
    }

    #[test]
    fn test_token_without_expiry_accepted() {
        let claims = validate_token(&sign("user-123", None, SECRET), SECRET).unwrap();
        assert_eq!(claims.user_id, "user-123");
        assert!(claims.exp.is_none());

        let forged = sign("user-123", None, "other-secret");
        assert_eq!(validate_token(&forged, SECRET).unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn test_garbage_token_rejects() {
        let result = validate_token("not.a.jwt", SECRET);
        assert_eq!(result.unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn test_bearer_header() {
        let good = token("user-123", now() + 900, SECRET);
        let claims = authenticate(&headers(&format!("Bearer {good}")), SECRET).unwrap();
        assert_eq!(claims.user_id, "user-123");

        assert_eq!(authenticate(&HeaderMap::new(), SECRET).unwrap_err(), AuthError::MissingToken);
        assert_eq!(authenticate(&headers(&format!("Basic {good}")), SECRET).unwrap_err(), AuthError::MissingToken);
        assert_eq!(authenticate(&headers("Bearer "), SECRET).unwrap_err(), AuthError::MissingToken);
    }
}
