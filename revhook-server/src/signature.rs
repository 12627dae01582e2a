//! Webhook authenticity checks, one scheme per platform.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::IngestError;
use crate::platform::Platform;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";
pub const BITBUCKET_SIGNATURE_HEADER: &str = "x-hub-signature";

/// Hex HMAC-SHA256 of `payload` keyed with `secret`.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// `sha256=<hex>` as the platforms send it.
pub fn format_signature(secret: &str, payload: &[u8]) -> String {
    format!("sha256={}", compute_signature(secret, payload))
}

/// Check a `sha256=<hex>` header value against the body.
pub fn verify_hmac(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Constant-time comparison of a static token.
pub fn verify_token(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify a delivery for a project with the given secret.
///
/// GitLab and GitHub deliveries to a project without a secret are refused.
/// Bitbucket has no standard signature, so a project without a secret
/// accepts it unauthenticated; with a secret, `X-Hub-Signature` must carry
/// the HMAC.
pub fn verify(
    platform: Platform,
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), IngestError> {
    match (platform, secret) {
        (Platform::Bitbucket, None) => Ok(()),
        (_, None) => Err(IngestError::Unauthorized("project has no webhook secret")),
        (Platform::GitLab, Some(secret)) => {
            let token = header(headers, GITLAB_TOKEN_HEADER)
                .ok_or(IngestError::Unauthorized("missing token"))?;
            if verify_token(secret, token) {
                Ok(())
            } else {
                Err(IngestError::Unauthorized("token mismatch"))
            }
        }
        (Platform::GitHub, Some(secret)) => {
            check_hmac(secret, header(headers, GITHUB_SIGNATURE_HEADER), body)
        }
        (Platform::Bitbucket, Some(secret)) => {
            check_hmac(secret, header(headers, BITBUCKET_SIGNATURE_HEADER), body)
        }
    }
}

fn check_hmac(secret: &str, signature: Option<&str>, body: &[u8]) -> Result<(), IngestError> {
    let signature = signature.ok_or(IngestError::Unauthorized("missing signature"))?;
    if verify_hmac(secret, body, signature) {
        Ok(())
    } else {
        Err(IngestError::Unauthorized("invalid signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use proptest::prelude::*;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_known_github_vector() {
        // From GitHub's webhook documentation.
        assert_eq!(
            format_signature("It's a Secret to Everybody", b"Hello, World!"),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn test_github_signature_accepted() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let headers = headers_with(GITHUB_SIGNATURE_HEADER, &format_signature("s3cret", body));
        assert!(verify(Platform::GitHub, Some("s3cret"), &headers, body).is_ok());
    }

    #[test]
    fn test_github_missing_or_malformed_signature() {
        let body = b"{}";
        assert!(matches!(
            verify(Platform::GitHub, Some("s3cret"), &HeaderMap::new(), body),
            Err(IngestError::Unauthorized(_))
        ));
        for bad in ["deadbeef", "sha1=abc", "sha256=not-hex", "sha256="] {
            let headers = headers_with(GITHUB_SIGNATURE_HEADER, bad);
            assert!(verify(Platform::GitHub, Some("s3cret"), &headers, body).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_gitlab_token() {
        let good = headers_with(GITLAB_TOKEN_HEADER, "s3cret");
        assert!(verify(Platform::GitLab, Some("s3cret"), &good, b"{}").is_ok());

        let bad = headers_with(GITLAB_TOKEN_HEADER, "s3cres");
        assert!(verify(Platform::GitLab, Some("s3cret"), &bad, b"{}").is_err());
        assert!(verify(Platform::GitLab, Some("s3cret"), &HeaderMap::new(), b"{}").is_err());
    }

    #[test]
    fn test_missing_secret() {
        assert!(verify(Platform::Bitbucket, None, &HeaderMap::new(), b"{}").is_ok());
        assert!(verify(Platform::GitHub, None, &HeaderMap::new(), b"{}").is_err());
        assert!(verify(Platform::GitLab, None, &HeaderMap::new(), b"{}").is_err());
    }

    #[test]
    fn test_bitbucket_with_secret_requires_signature() {
        let body = b"{\"push\":{}}";
        assert!(verify(Platform::Bitbucket, Some("k"), &HeaderMap::new(), body).is_err());

        let headers = headers_with(BITBUCKET_SIGNATURE_HEADER, &format_signature("k", body));
        assert!(verify(Platform::Bitbucket, Some("k"), &headers, body).is_ok());
    }

    proptest! {
        #[test]
        fn prop_signature_roundtrip(secret in "[ -~]{1,40}", body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let signature = format_signature(&secret, &body);
            prop_assert!(verify_hmac(&secret, &body, &signature));
        }

        #[test]
        fn prop_wrong_secret_rejected(
            secret in "[a-z]{1,20}",
            other in "[A-Z]{1,20}",
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let signature = format_signature(&other, &body);
            prop_assert!(!verify_hmac(&secret, &body, &signature));
        }

        #[test]
        fn prop_tampered_body_rejected(
            secret in "[a-z]{1,20}",
            body in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
        ) {
            let signature = format_signature(&secret, &body);
            let mut tampered = body.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= 0x01;
            prop_assert!(!verify_hmac(&secret, &tampered, &signature));
        }
    }
}
