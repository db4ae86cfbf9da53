//! Local bearer-token verification
//!
//! Tokens are verified in-process (signature and expiry) with no call to
//! the auth service, so a revoked token stays valid until it expires.

use crate::error::AuthError;
use anyhow::{bail, Context};
use gateway_core::JwtSettings;
use hyper::header::{HeaderMap, AUTHORIZATION};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_ROLE: &str = "user";

/// Authenticated identity attached to a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub subject_id: String,
    pub role: String,
    pub is_active: bool,
}

/// Capability to turn a raw token into a principal
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<serde_json::Value>,
    role: Option<String>,
    is_active: Option<bool>,
    disabled: Option<bool>,
}

/// JWT verifier backed by `jsonwebtoken`
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(algorithm: Algorithm, key: DecodingKey, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        Self { key, validation }
    }

    /// HMAC verifier from a shared secret
    pub fn with_secret(algorithm: Algorithm, secret: &[u8]) -> Self {
        Self::new(algorithm, DecodingKey::from_secret(secret), 0)
    }

    /// Pick the key type from the configured algorithm
    pub fn from_settings(settings: &JwtSettings) -> anyhow::Result<Self> {
        let algorithm = settings.algorithm;
        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = settings
                    .secret
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .context("JWT secret is required for HMAC algorithms (set JWT_SECRET)")?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            _ => {
                let Some(pem) = settings.public_key_pem.as_deref().filter(|k| !k.trim().is_empty()) else {
                    bail!("JWT public key is required for {:?} (set JWT_PUBLIC_KEY)", algorithm);
                };
                match algorithm {
                    Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem.as_bytes()),
                    Algorithm::EdDSA => DecodingKey::from_ed_pem(pem.as_bytes()),
                    _ => DecodingKey::from_rsa_pem(pem.as_bytes()),
                }
                .context("Failed to parse JWT public key")?
            }
        };

        info!("JWT verification configured with {:?}", algorithm);
        Ok(Self::new(algorithm, key, settings.leeway_secs))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!("Token rejected: {}", e);
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
                _ => AuthError::Malformed,
            }
        })?;
        let claims = data.claims;

        let subject_id = match claims.sub {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(AuthError::Malformed),
        };

        let is_active = claims.is_active.unwrap_or(true) && !claims.disabled.unwrap_or(false);
        if !is_active {
            debug!(subject = %subject_id, "Token belongs to an inactive user");
            return Err(AuthError::Inactive);
        }

        Ok(Principal {
            subject_id,
            role: claims.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            is_active,
        })
    }
}

/// Extracts the bearer credential and hands it to the verifier
#[derive(Clone)]
pub struct AuthDelegate {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthDelegate {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = Self::bearer_token(headers)?;
        self.verifier.verify(token)
    }

    /// The token from `Authorization: Bearer <token>`
    pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;

        let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::Missing)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Missing);
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"campus-secret";

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::with_secret(Algorithm::HS256, SECRET)
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_valid_token() {
        let token = sign(json!({"sub": "42", "role": "instructor", "exp": now() + 600}));
        let principal = verifier().verify(&token).unwrap();
        assert_eq!(principal.subject_id, "42");
        assert_eq!(principal.role, "instructor");
        assert!(principal.is_active);
    }

    #[test]
    fn test_numeric_subject_and_default_role() {
        let token = sign(json!({"sub": 7, "exp": now() + 600}));
        let principal = verifier().verify(&token).unwrap();
        assert_eq!(principal.subject_id, "7");
        assert_eq!(principal.role, "user");
    }

    #[test]
    fn test_expired_token() {
        let token = sign(json!({"sub": "42", "exp": now() - 600}));
        assert_eq!(verifier().verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_missing_exp_is_malformed() {
        let token = sign(json!({"sub": "42"}));
        assert_eq!(verifier().verify(&token), Err(AuthError::Malformed));
    }

    #[test]
    fn test_wrong_secret() {
        let token = sign(json!({"sub": "42", "exp": now() + 600}));
        let other = JwtVerifier::with_secret(Algorithm::HS256, b"another-secret");
        assert_eq!(other.verify(&token), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_garbage_token() {
        assert_eq!(verifier().verify("not.a.jwt"), Err(AuthError::Malformed));
    }

    #[test]
    fn test_inactive_user() {
        let token = sign(json!({"sub": "42", "exp": now() + 600, "is_active": false}));
        assert_eq!(verifier().verify(&token), Err(AuthError::Inactive));

        let token = sign(json!({"sub": "42", "exp": now() + 600, "disabled": true}));
        assert_eq!(verifier().verify(&token), Err(AuthError::Inactive));
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(AuthDelegate::bearer_token(&headers("Bearer abc")), Ok("abc"));
        assert_eq!(AuthDelegate::bearer_token(&headers("bearer  abc ")), Ok("abc"));
        assert_eq!(AuthDelegate::bearer_token(&headers("Basic dXNlcg==")), Err(AuthError::Missing));
        assert_eq!(AuthDelegate::bearer_token(&headers("Bearer")), Err(AuthError::Missing));
        assert_eq!(AuthDelegate::bearer_token(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[test]
    fn test_authenticate() {
        let delegate = AuthDelegate::new(Arc::new(verifier()));
        let token = sign(json!({"sub": "42", "exp": now() + 600}));
        let principal = delegate.authenticate(&headers(&format!("Bearer {}", token))).unwrap();
        assert_eq!(principal.subject_id, "42");
        assert_eq!(delegate.authenticate(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[test]
    fn test_from_settings_requires_secret() {
        let settings = JwtSettings::default();
        assert!(JwtVerifier::from_settings(&settings).is_err());

        let settings = JwtSettings {
            secret: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert!(JwtVerifier::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_from_settings_rsa_requires_key() {
        let settings = JwtSettings {
            algorithm: Algorithm::RS256,
            secret: Some("ignored".to_string()),
            ..Default::default()
        };
        assert!(JwtVerifier::from_settings(&settings).is_err());
    }
}
