use thiserror::Error;

use crate::topic::TopicError;

/// The crate's typed error, split between the handful of kinds an ingress
/// handler needs to answer differently. "Not-applicable" paths
/// (subscribe/unsubscribe against an unknown session) are deliberately
/// *not* a variant here — those are silent no-ops, not errors, so there is
/// nothing to construct or swallow.
#[derive(Debug, Error)]
pub enum PikavError {
    /// Bad topic, bad filter, missing session id, missing/invalid token.
    /// Maps to HTTP 400 at the ingress boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Marshal failure, forward network error. Maps to HTTP 500 or is
    /// logged and the operation continues; never corrupts index state.
    #[error("internal error: {0}")]
    Internal(String),

    /// Broker receive error, JWKS bootstrap failure. Terminates the owning
    /// task; operator-visible via logs.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JWT/JWKS error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PikavError {
    /// The status code an ingress handler should answer with: validation
    /// failures are 400, everything else reaching the handler boundary is
    /// 500.
    pub fn status_code(&self) -> warp::http::StatusCode {
        match self {
            PikavError::Validation(_) | PikavError::Topic(_) => warp::http::StatusCode::BAD_REQUEST,
            _ => warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
