use std::time::Duration;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::error::PikavError;

/// How often the JWKS document is refreshed on a timer, independent of
/// unknown-`kid` refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies a bearer token against a JWKS endpoint, returning the verified
/// `sub` claim as the user id.
///
/// Maintains a cached key set, refreshed on an interval and on encountering
/// an unrecognized `kid`.
pub struct Auth {
    jwks_url: String,
    http: reqwest::Client,
    keys: RwLock<JwkSet>,
}

impl Auth {
    pub async fn new(jwks_url: impl Into<String>) -> Result<Self, PikavError> {
        let jwks_url = jwks_url.into();
        let http = reqwest::Client::new();
        let keys = fetch_jwks(&http, &jwks_url).await?;
        Ok(Auth {
            jwks_url,
            http,
            keys: RwLock::new(keys),
        })
    }

    /// Spawns the periodic background refresh. A failed refresh is logged
    /// and the previous key set is kept; only the bootstrap fetch is fatal.
    pub fn spawn_periodic_refresh(self: &std::sync::Arc<Self>) {
        let auth = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(error) = auth.refresh().await {
                    warn!(%error, "periodic JWKS refresh failed, keeping previous key set");
                }
            }
        });
    }

    async fn refresh(&self) -> Result<(), PikavError> {
        let keys = fetch_jwks(&self.http, &self.jwks_url).await?;
        *self.keys.write().await = keys;
        Ok(())
    }

    /// Validates the `Authorization: Bearer <jwt>` header and returns the
    /// verified user id.
    pub async fn user_id(&self, authorization_header: Option<&str>) -> Result<String, PikavError> {
        let token = extract_bearer(authorization_header)?;
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| PikavError::Validation("token header has no kid".to_string()))?;

        let mut jwk = self.find_key(&kid).await;
        if jwk.is_none() {
            // RefreshUnknownKID: an unrecognized kid might mean the
            // signing key rotated since our last fetch.
            self.refresh().await?;
            jwk = self.find_key(&kid).await;
        }
        let jwk = jwk.ok_or_else(|| PikavError::Validation(format!("unknown signing key `{kid}`")))?;

        let decoding_key = DecodingKey::from_jwk(&jwk)?;
        let algorithm = algorithm_of(&jwk)?;
        let validation = Validation::new(algorithm);
        let data = decode::<Claims>(token, &decoding_key, &validation)?;
        Ok(data.claims.sub)
    }

    async fn find_key(&self, kid: &str) -> Option<Jwk> {
        self.keys
            .read()
            .await
            .find(kid)
            .cloned()
    }
}

fn algorithm_of(jwk: &Jwk) -> Result<Algorithm, PikavError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Ok(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(_) => Ok(Algorithm::ES256),
        AlgorithmParameters::OctetKey(_) => Ok(Algorithm::HS256),
        other => Err(PikavError::Validation(format!(
            "unsupported JWK algorithm family: {other:?}"
        ))),
    }
}

fn extract_bearer(header: Option<&str>) -> Result<&str, PikavError> {
    let header =
        header.ok_or_else(|| PikavError::Validation("missing authorization header".to_string()))?;
    match header.split_once(' ') {
        Some(("Bearer", token)) if !token.is_empty() => Ok(token),
        _ => Err(PikavError::Validation(
            "invalid authorization http header".to_string(),
        )),
    }
}

async fn fetch_jwks(http: &reqwest::Client, url: &str) -> Result<JwkSet, PikavError> {
    let response = http.get(url).send().await.map_err(|error| {
        error!(%error, %url, "failed to fetch JWKS");
        PikavError::Fatal(format!("failed to fetch JWKS from {url}: {error}"))
    })?;
    response
        .json::<JwkSet>()
        .await
        .map_err(|error| PikavError::Fatal(format!("failed to parse JWKS from {url}: {error}")))
}

/// Extracts the session id from the `X-Pikav-Session-ID` header. Not
/// JWT-related, but lives alongside `Auth` since both are header-extraction
/// concerns the ingress handlers call before doing anything else.
pub const SESSION_ID_HEADER: &str = "X-Pikav-Session-ID";

pub fn session_id(header_value: Option<&str>) -> Result<String, PikavError> {
    match header_value {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(PikavError::Validation(
            "missing X-Pikav-Session-ID header".to_string(),
        )),
    }
}
