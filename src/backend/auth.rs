//! Session Tokens
//!
//! HS256 session tokens issued by the in-process backend, and the
//! deterministic player-id derivation used for device authentication.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token issuing configuration.
#[derive(Clone, Debug)]
pub struct TokenConfig {
    /// HS256 signing secret.
    pub secret: String,
    /// Issuer claim written into every token.
    pub issuer: String,
    /// Token lifetime in seconds.
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "relay-dev-secret-change-me".into(),
            issuer: "relay-gateway".into(),
            ttl_secs: 86_400,
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Player id.
    pub sub: String,
    /// Scope key the token was issued under.
    pub gk: String,
    /// Expiry timestamp (Unix seconds).
    pub exp: u64,
    /// Issued at timestamp.
    pub iat: u64,
    /// Issuer.
    pub iss: String,
}

/// Token errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Token was issued for another scope key.
    #[error("token issued for a different game")]
    ScopeMismatch,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Encoding failed.
    #[error("encode error: {0}")]
    EncodeError(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Derive a stable player id from scope key and device id.
///
/// Hex of the first 16 bytes of SHA-256 over `scope:device`.
pub fn derive_player_id(scope_key: &str, device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope_key.as_bytes());
    hasher.update(b":");
    hasher.update(device_id.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..16])
}

/// Issue a session token for a player.
pub fn issue_token(
    player_id: &str,
    scope_key: &str,
    config: &TokenConfig,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let claims = SessionClaims {
        sub: player_id.to_string(),
        gk: scope_key.to_string(),
        exp: now + config.ttl_secs,
        iat: now,
        iss: config.issuer.clone(),
    };
    let key = EncodingKey::from_secret(config.secret.as_bytes());
    encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| AuthError::EncodeError(e.to_string()))
}

/// Validate a session token for the given scope key and extract its claims.
pub fn validate_token(
    token: &str,
    scope_key: &str,
    config: &TokenConfig,
) -> Result<SessionClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.validate_aud = false;

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let claims = decode::<SessionClaims>(token, &key, &validation)
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    if claims.gk != scope_key {
        return Err(AuthError::ScopeMismatch);
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenConfig {
        TokenConfig {
            secret: "test-secret-key-256-bits-long!!".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_issue_and_validate() {
        let token = issue_token("p1", "g1", &config()).unwrap();
        let claims = validate_token(&token, "g1", &config()).unwrap();
        assert_eq!(claims.sub, "p1");
        assert_eq!(claims.gk, "g1");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_scope_rejected() {
        let token = issue_token("p1", "g1", &config()).unwrap();
        let result = validate_token(&token, "g2", &config());
        assert!(matches!(result, Err(AuthError::ScopeMismatch)));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = issue_token("p1", "g1", &config()).unwrap();
        let other = TokenConfig {
            secret: "wrong-secret-key-here!!!!!!".into(),
            ..Default::default()
        };
        let result = validate_token(&token, "g1", &other);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = SessionClaims {
            sub: "p1".into(),
            gk: "g1".into(),
            exp: 1,
            iat: 0,
            iss: config().issuer,
        };
        let key = EncodingKey::from_secret(config().secret.as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap();

        let result = validate_token(&token, "g1", &config());
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let result = validate_token("not-a-jwt", "g1", &config());
        assert!(matches!(
            result,
            Err(AuthError::InvalidFormat) | Err(AuthError::DecodeError(_))
        ));
    }

    #[test]
    fn test_player_id_derivation() {
        let id1 = derive_player_id("g1", "d1");
        let id2 = derive_player_id("g1", "d1");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 32);

        // Scope and device both matter
        assert_ne!(id1, derive_player_id("g2", "d1"));
        assert_ne!(id1, derive_player_id("g1", "d2"));
    }
}
