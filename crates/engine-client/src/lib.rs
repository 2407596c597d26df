#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! # `engine-client`
//!
//! Authenticated session against an execution client's engine API surface.
//! Derives a short-lived HS256 bearer credential from the shared secret for
//! each call window, submits `engine_newPayload`/`engine_forkchoiceUpdated`
//! requests, and exposes the handful of `eth_` queries the harness needs
//! for readiness polling and chain inspection.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::JwtProvider;
pub use client::{
    EngineClient,
    EngineClientConfig,
    LatestBlock,
};
pub use error::EngineApiError;
