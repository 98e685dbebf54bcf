//! RS256 key-set provisioning for bearer verification.
//!
//! Keys come either from a static JWKS document supplied at startup (used in
//! testing) or from the issuer's well-known JWKS location, fetched on demand
//! and cached for a fixed refresh interval.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::DecodingKey;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// How long a fetched key set is served before it is re-fetched.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Source of the key set used to verify bearer signatures.
#[derive(Debug)]
pub enum KeySetProvider {
    Static(JwkSet),
    Remote(RemoteKeySet),
}

/// A JWKS document fetched from the issuer, refreshed when older than
/// [`REFRESH_INTERVAL`]. Concurrent readers share the cached snapshot.
#[derive(Debug)]
pub struct RemoteKeySet {
    http: reqwest::Client,
    jwks_url: Url,
    cached: RwLock<Option<(JwkSet, Instant)>>,
}

impl KeySetProvider {
    /// Parse a static JWKS document.
    pub fn from_document(document: &str) -> Result<Self> {
        let keys: JwkSet = serde_json::from_str(document).context("could not decode JWKS")?;
        Ok(KeySetProvider::Static(keys))
    }

    /// Fetch from the issuer's well-known JWKS location.
    pub fn remote(issuer_url: &Url, http: reqwest::Client) -> Self {
        KeySetProvider::Remote(RemoteKeySet {
            http,
            jwks_url: well_known_jwks_url(issuer_url),
            cached: RwLock::new(None),
        })
    }

    pub async fn key_set(&self) -> Result<JwkSet> {
        match self {
            KeySetProvider::Static(keys) => Ok(keys.clone()),
            KeySetProvider::Remote(remote) => remote.current().await,
        }
    }
}

impl RemoteKeySet {
    async fn current(&self) -> Result<JwkSet> {
        if let Some((keys, fetched_at)) = &*self.cached.read().await {
            if fetched_at.elapsed() < REFRESH_INTERVAL {
                return Ok(keys.clone());
            }
        }

        let mut guard = self.cached.write().await;

        // another task may have refreshed while we waited for the lock
        if let Some((keys, fetched_at)) = &*guard {
            if fetched_at.elapsed() < REFRESH_INTERVAL {
                return Ok(keys.clone());
            }
        }

        debug!(url = %self.jwks_url, "fetching key set");
        let keys: JwkSet = self
            .http
            .get(self.jwks_url.clone())
            .send()
            .await
            .context("key set fetch failed")?
            .error_for_status()
            .context("key set fetch returned error status")?
            .json()
            .await
            .context("could not decode fetched key set")?;

        *guard = Some((keys.clone(), Instant::now()));

        Ok(keys)
    }
}

/// Derive the JWKS URL from the issuer URL using the OIDC discovery
/// convention.
fn well_known_jwks_url(issuer_url: &Url) -> Url {
    let base = issuer_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/.well-known/jwks.json"))
        .unwrap_or_else(|_| issuer_url.clone())
}

// ---------------------------------------------------------------------------
// Key selection
// ---------------------------------------------------------------------------

/// Select the decoding key for a token. Keys are matched by `kid`; a token
/// without a `kid` is accepted only when the set holds exactly one key.
pub fn decoding_key_for(keys: &JwkSet, kid: Option<&str>) -> Result<DecodingKey> {
    let jwk = match kid {
        Some(kid) => keys
            .find(kid)
            .ok_or_else(|| anyhow!("no key found for kid {kid}"))?,
        None if keys.keys.len() == 1 => &keys.keys[0],
        None => bail!("token header has no key id"),
    };

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .context("invalid RSA key components in key set"),
        _ => bail!("unsupported key type in key set"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
