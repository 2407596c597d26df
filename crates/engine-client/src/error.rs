//! Error types for the engine API session.

use crate::auth::AuthError;
use thiserror::Error;

/// Errors surfaced by [`crate::EngineClient`].
///
/// Transport and HTTP-level failures are transient from the caller's point
/// of view and may be retried; `Rpc` errors carry whatever the client
/// reported and are generally fatal to the call that produced them.
#[derive(Debug, Error)]
pub enum EngineApiError {
    /// HTTP transport error
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response outside the auth-retry path
    #[error("engine endpoint returned http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Token kept being rejected after refresh attempts
    #[error("authentication retries exhausted")]
    AuthExhausted,

    /// JSON-RPC error object in the response body
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response had neither a result nor an error
    #[error("no result in rpc response")]
    MissingResult,

    /// Result did not deserialize into the expected shape
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(#[from] serde_json::Error),

    /// Credential derivation failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// V3 submissions require the parent beacon block root
    #[error("record {0} is a V3 payload without a parent beacon block root")]
    MissingParentBeaconRoot(u64),
}

/// Result type alias for the engine client.
pub type Result<T> = std::result::Result<T, EngineApiError>;
