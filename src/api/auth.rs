//! Bearer-token authentication middleware.
//!
//! Token issuance and renewal live outside this service; the SSO layer in
//! front of us forwards the opaque access token plus the character id it
//! belongs to. Handlers read the resulting `Principal` from request
//! extensions.

use crate::api::ApiError;
use crate::error::Error;
use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

/// Header carrying the authenticated character id, set by the SSO adapter.
pub const CHARACTER_ID_HEADER: &str = "x-character-id";

/// The authenticated caller: an opaque upstream token plus the character it
/// was issued for.
#[derive(Debug, Clone)]
pub struct Principal {
    pub character_id: i64,
    pub token: String,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

pub fn character_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(CHARACTER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Rejects requests without a complete principal; otherwise stores it in
/// the request extensions for the handlers.
pub async fn require_principal(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError(Error::Unauthorized))?;
    let character_id = character_id(req.headers()).ok_or(ApiError(Error::Unauthorized))?;

    req.extensions_mut().insert(Principal {
        character_id,
        token,
    });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_token_requires_scheme() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc123")])),
            Some("abc123".to_string())
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "abc123")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn character_id_parses_numeric_header() {
        assert_eq!(
            character_id(&headers(&[("x-character-id", "91234567")])),
            Some(91234567)
        );
        assert_eq!(character_id(&headers(&[("x-character-id", "abc")])), None);
        assert_eq!(character_id(&HeaderMap::new()), None);
    }
}
