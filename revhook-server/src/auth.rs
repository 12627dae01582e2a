//! Bearer authentication for the stream and admin endpoints.
//!
//! Live streams take an HS256 JWT signed with `STREAM_JWT_SECRET`, either in
//! `Authorization: Bearer` or a `token` query parameter, since browser
//! `EventSource` cannot set headers. Admin endpoints compare a static token.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClaims {
    /// Who the stream is for; shows up in logs.
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn now_secs() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("Failed to get current time")?
        .as_secs())
}

/// Mint a stream token. Served to admins by `POST /api/events/token`.
pub fn issue_stream_token(secret: &str, subject: &str, ttl_secs: u64) -> Result<String> {
    let now = now_secs()?;
    let claims = StreamClaims {
        sub: subject.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to encode JWT")
}

/// Validate signature and expiry.
pub fn verify_stream_token(secret: &str, token: &str) -> Result<StreamClaims> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<StreamClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("Invalid stream token")?;
    Ok(data.claims)
}

/// Constant-time check of a presented admin token.
pub fn admin_token_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) => expected.as_bytes().ct_eq(presented.as_bytes()).into(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_stream_token_roundtrip() {
        let token = issue_stream_token("jwt-secret", "dashboard", 60).unwrap();
        let claims = verify_stream_token("jwt-secret", &token).unwrap();
        assert_eq!(claims.sub, "dashboard");
        assert!(verify_stream_token("other-secret", &token).is_err());
    }

    #[test]
    fn test_expired_stream_token_rejected() {
        let now = now_secs().unwrap();
        let claims = StreamClaims {
            sub: "old".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"jwt-secret"),
        )
        .unwrap();
        assert!(verify_stream_token("jwt-secret", &token).is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn test_admin_token() {
        assert!(admin_token_matches("admin", Some("admin")));
        assert!(!admin_token_matches("admin", Some("admin2")));
        assert!(!admin_token_matches("admin", None));
    }
}
