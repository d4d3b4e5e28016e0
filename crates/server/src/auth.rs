//! Bearer-token verification for sockets and REST calls.
//!
//! Tokens are issued by the account service; this server only checks them.
//! Format: `<user_id>:<expires_unix>:<signature>` where the signature is the
//! hex SHA-256 of `<secret>:<user_id>:<expires_unix>`.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("bad token signature")]
    BadSignature,
}

#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify a token against `now` (seconds since epoch) and return the
    /// user id it was issued for.
    pub fn verify(&self, token: &str, now_unix: i64) -> Result<String, AuthError> {
        let mut parts = token.split(':');
        let (user_id, expires, signature) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(u), Some(e), Some(s), None) if !u.is_empty() => (u, e, s),
            _ => return Err(AuthError::Malformed),
        };

        let expires_unix: i64 = expires.parse().map_err(|_| AuthError::Malformed)?;

        let expected = signature_for(&self.secret, user_id, expires_unix);
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return Err(AuthError::BadSignature);
        }
        if expires_unix < now_unix {
            return Err(AuthError::Expired);
        }
        Ok(user_id.to_string())
    }

    /// Produce a token the verifier will accept. The production issuer lives
    /// elsewhere; this mirrors its output for tests and local tooling.
    pub fn mint(&self, user_id: &str, expires_unix: i64) -> String {
        format!(
            "{user_id}:{expires_unix}:{}",
            signature_for(&self.secret, user_id, expires_unix)
        )
    }
}

fn signature_for(secret: &str, user_id: &str, expires_unix: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{secret}:{user_id}:{expires_unix}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Length-then-bytes comparison that does not short-circuit on the first
/// mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let raw = header_value.trim();
    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    (!token.is_empty()).then_some(token)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("unit-test-secret")
    }

    #[test]
    fn minted_token_verifies() {
        let v = verifier();
        let token = v.mint("user-42", NOW + 3600);
        assert_eq!(v.verify(&token, NOW), Ok("user-42".to_string()));
    }

    #[test]
    fn expired_token_rejected() {
        let v = verifier();
        let token = v.mint("user-42", NOW - 1);
        assert_eq!(v.verify(&token, NOW), Err(AuthError::Expired));
    }

    #[test]
    fn token_valid_at_exact_expiry_instant() {
        let v = verifier();
        let token = v.mint("user-42", NOW);
        assert!(v.verify(&token, NOW).is_ok());
    }

    #[test]
    fn tampered_user_rejected() {
        let v = verifier();
        let token = v.mint("user-42", NOW + 3600);
        let tampered = token.replacen("user-42", "user-43", 1);
        assert_eq!(v.verify(&tampered, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = TokenVerifier::new("other-secret").mint("user-42", NOW + 3600);
        assert_eq!(verifier().verify(&token, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn malformed_tokens_rejected() {
        let v = verifier();
        for bad in ["", "user-42", "user-42:123", "a:b:c:d", ":123:abc", "user:notanum:abc"] {
            assert_eq!(v.verify(bad, NOW), Err(AuthError::Malformed), "{bad:?}");
        }
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("  Bearer   abc  "), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token(""), None);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
