//! Bearer credential derivation for the authenticated engine surface.
//!
//! The engine API authenticates with an HS256 JWT signed over the shared
//! 32-byte hex secret. Tokens are valid for a short window; the provider
//! caches the current token and mints a fresh one when it comes within the
//! refresh threshold of expiry. A client that still gets rejected can
//! invalidate the cache and widen the validity window before retrying.

use chrono::Utc;
use jsonwebtoken::{
    Algorithm,
    EncodingKey,
    Header,
    encode,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::path::{
    Path,
    PathBuf,
};
use tracing::debug;

/// Default token validity window in seconds.
pub const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 120;

/// Widened validity is capped here, matching the longest window clients
/// are known to accept.
const MAX_TOKEN_VALIDITY_SECS: u64 = 3600;

/// A token this close to expiry is replaced rather than reused.
const REFRESH_THRESHOLD_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("jwt secret file not found: {0}")]
    SecretNotFound(PathBuf),

    #[error("jwt secret is not valid hex")]
    InvalidSecret(#[from] hex::FromHexError),

    #[error("failed to read jwt secret file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to sign jwt: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Serialize)]
struct Claims {
    iat: i64,
    exp: i64,
}

struct Cached {
    token: String,
    expires_at: i64,
}

struct Inner {
    cached: Option<Cached>,
    validity_secs: u64,
}

/// Thread-safe provider of cached bearer tokens.
pub struct JwtProvider {
    key: EncodingKey,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for JwtProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtProvider").finish_non_exhaustive()
    }
}

impl JwtProvider {
    pub fn new(secret: &[u8], validity_secs: u64) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            inner: Mutex::new(Inner {
                cached: None,
                validity_secs,
            }),
        }
    }

    /// Builds a provider from the hex form of the shared secret.
    pub fn from_hex(hex_secret: &str, validity_secs: u64) -> Result<Self, AuthError> {
        let secret = hex::decode(hex_secret.trim().trim_start_matches("0x"))?;
        Ok(Self::new(&secret, validity_secs))
    }

    /// Reads the hex secret from a file, the form every client ships it in.
    pub fn from_file(path: &Path, validity_secs: u64) -> Result<Self, AuthError> {
        if !path.is_file() {
            return Err(AuthError::SecretNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_hex(&raw, validity_secs)
    }

    /// Generates a fresh 32-byte shared secret in hex form, suitable for
    /// writing into a client's jwtsecret file.
    pub fn generate_secret() -> String {
        let secret: [u8; 32] = rand::rng().random();
        hex::encode(secret)
    }

    /// Returns a bearer token, reusing the cached one while it stays clear
    /// of the refresh threshold.
    pub fn bearer(&self) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();

        let validity = {
            let inner = self.inner.lock();
            if let Some(cached) = &inner.cached
                && now < cached.expires_at - REFRESH_THRESHOLD_SECS
            {
                return Ok(cached.token.clone());
            }
            inner.validity_secs
        };

        // Sign outside the lock; signing is cheap but there is no reason to
        // serialize other callers behind it.
        let claims = Claims {
            iat: now,
            exp: now + validity as i64,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.key)?;

        let mut inner = self.inner.lock();
        // Another caller may have refreshed meanwhile; keep whichever token
        // expires later.
        let replace = match &inner.cached {
            Some(cached) => cached.expires_at < now + validity as i64,
            None => true,
        };
        if replace {
            inner.cached = Some(Cached {
                token: token.clone(),
                expires_at: now + validity as i64,
            });
        }
        Ok(token)
    }

    /// Drops the cached token and doubles the validity window, capped.
    /// Called after the endpoint rejected a token: some clients enforce a
    /// tighter clock skew than others, and a wider window absorbs it.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.cached = None;
        inner.validity_secs = (inner.validity_secs * 2).min(MAX_TOKEN_VALIDITY_SECS);
        debug!(validity_secs = inner.validity_secs, "invalidated cached jwt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> JwtProvider {
        JwtProvider::from_hex(&JwtProvider::generate_secret(), DEFAULT_TOKEN_VALIDITY_SECS)
            .unwrap()
    }

    #[test]
    fn generated_secret_is_32_bytes_hex() {
        let secret = JwtProvider::generate_secret();
        assert_eq!(hex::decode(&secret).unwrap().len(), 32);
    }

    #[test]
    fn token_is_cached_until_invalidated() {
        let provider = provider();
        let first = provider.bearer().unwrap();
        let second = provider.bearer().unwrap();
        assert_eq!(first, second);

        provider.invalidate();
        // A fresh token may share iat/exp second granularity with the old
        // one, so force distinct expiry through the widened validity.
        let third = provider.bearer().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn token_has_three_segments() {
        let token = provider().bearer().unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn rejects_non_hex_secret() {
        assert!(JwtProvider::from_hex("not hex", DEFAULT_TOKEN_VALIDITY_SECS).is_err());
    }

    #[test]
    fn accepts_0x_prefixed_secret_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jwtsecret.hex");
        std::fs::write(&path, format!("0x{}\n", JwtProvider::generate_secret())).unwrap();
        assert!(JwtProvider::from_file(&path, DEFAULT_TOKEN_VALIDITY_SECS).is_ok());
    }

    #[test]
    fn missing_secret_file_is_reported() {
        let err = JwtProvider::from_file(Path::new("/nonexistent/jwt.hex"), 120).unwrap_err();
        assert!(matches!(err, AuthError::SecretNotFound(_)));
    }
}
