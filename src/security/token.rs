//! Signed short-lived session tokens for admin surfaces.
//!
//! Token format: `subject.expires_unix.signature` where the signature is
//! HMAC-SHA256 over the canonically ordered claim set with the shared
//! secret. Stateless: verification needs only the secret and the clock.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::providers::signing::{canonical_query, hmac_sha256_sign, signature_matches};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired at {0}")]
    Expired(i64),
    #[error("token signature invalid")]
    BadSignature,
}

/// Verified token claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub subject: String,
    pub expires_unix: i64,
}

fn claims_canonical(subject: &str, expires_unix: i64) -> String {
    let mut claims = BTreeMap::new();
    claims.insert("expires_at".to_string(), expires_unix.to_string());
    claims.insert("subject".to_string(), subject.to_string());
    canonical_query(&claims)
}

/// Issue a token for `subject` valid for `ttl` from `now_unix`.
pub fn issue_token(subject: &str, secret: &str, now_unix: i64, ttl: Duration) -> String {
    let expires_unix = now_unix + ttl.as_secs() as i64;
    let signature = hmac_sha256_sign(&claims_canonical(subject, expires_unix), secret);
    format!("{}.{}.{}", subject, expires_unix, signature)
}

/// Verify signature and expiry; returns the claims on success.
pub fn verify_token(token: &str, secret: &str, now_unix: i64) -> Result<SessionToken, TokenError> {
    // subject may not contain '.', the other two parts never do
    let mut parts = token.rsplitn(3, '.');
    let signature = parts.next().ok_or(TokenError::Malformed)?;
    let expires_raw = parts.next().ok_or(TokenError::Malformed)?;
    let subject = parts.next().ok_or(TokenError::Malformed)?;
    if subject.is_empty() {
        return Err(TokenError::Malformed);
    }
    let expires_unix: i64 = expires_raw.parse().map_err(|_| TokenError::Malformed)?;

    let expected = hmac_sha256_sign(&claims_canonical(subject, expires_unix), secret);
    if !signature_matches(&expected, signature) {
        return Err(TokenError::BadSignature);
    }
    if now_unix > expires_unix {
        return Err(TokenError::Expired(expires_unix));
    }
    Ok(SessionToken {
        subject: subject.to_string(),
        expires_unix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "token-secret";

    #[test]
    fn test_issue_and_verify() {
        let now = 1_700_000_000;
        let token = issue_token("admin-1", SECRET, now, Duration::from_secs(1800));
        let claims = verify_token(&token, SECRET, now + 100).unwrap();
        assert_eq!(claims.subject, "admin-1");
        assert_eq!(claims.expires_unix, now + 1800);
    }

    #[test]
    fn test_expired_token() {
        let now = 1_700_000_000;
        let token = issue_token("admin-1", SECRET, now, Duration::from_secs(60));
        // Valid exactly at expiry, rejected one second after
        assert!(verify_token(&token, SECRET, now + 60).is_ok());
        assert_eq!(
            verify_token(&token, SECRET, now + 61),
            Err(TokenError::Expired(now + 60))
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let token = issue_token("admin-1", SECRET, now, Duration::from_secs(60));
        assert_eq!(
            verify_token(&token, "other-secret", now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_subject_rejected() {
        let now = 1_700_000_000;
        let token = issue_token("admin-1", SECRET, now, Duration::from_secs(60));
        let tampered = token.replacen("admin-1", "admin-2", 1);
        assert_eq!(
            verify_token(&tampered, SECRET, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_malformed_tokens() {
        assert_eq!(
            verify_token("nodots", SECRET, 0),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            verify_token("a.b", SECRET, 0),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            verify_token("sub.notanumber.cafebabe", SECRET, 0),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn test_subject_with_dots_verifies() {
        let now = 1_700_000_000;
        let token = issue_token("svc.payments.admin", SECRET, now, Duration::from_secs(60));
        let claims = verify_token(&token, SECRET, now).unwrap();
        assert_eq!(claims.subject, "svc.payments.admin");
    }
}
