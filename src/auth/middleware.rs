//! Bearer verification middleware.
//!
//! Extracts the bearer from the `Authorization` header, verifies it as RS256
//! against the configured key set, enforces the registered and pipeline
//! claims, and attaches the verified [`IdentityClaims`] to the request.
//! Failures are stamped on the audit record and answered with a bare 401.

use anyhow::{Context as _, Result};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, Validation};
use url::Url;

use crate::audit::AuditHandle;
use crate::auth::claims::{Claims, IdentityClaims};
use crate::auth::keyset::{decoding_key_for, KeySetProvider};
use crate::config::AuthorizationConfig;
use crate::AppState;

/// Allowance for clock drift between the issuer and this host.
const CLOCK_SKEW_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Verifies bearer tokens against the configured issuer, audience and
/// organization. Shared across all requests.
pub struct TokenVerifier {
    keys: KeySetProvider,
    audience: String,
    issuer: String,
    expected_organization_slug: String,
}

impl TokenVerifier {
    pub fn new(cfg: &AuthorizationConfig, http: reqwest::Client) -> Result<Self> {
        let issuer_url = Url::parse(&cfg.issuer_url).context("failed to parse the issuer URL")?;

        // allow for static configuration when testing
        let keys = match &cfg.jwks_static {
            Some(document) => KeySetProvider::from_document(document)?,
            None => KeySetProvider::remote(&issuer_url, http),
        };

        Ok(Self {
            keys,
            audience: cfg.audience.clone(),
            issuer: cfg.issuer_url.clone(),
            expected_organization_slug: cfg.organization_slug.clone(),
        })
    }

    /// Verify `token` and return the identity it attests.
    pub async fn verify(&self, token: &str) -> Result<IdentityClaims> {
        let header = jsonwebtoken::decode_header(token).context("malformed token")?;

        let keys = self.keys.key_set().await?;
        let key = decoding_key_for(&keys, header.kid.as_deref())?;

        // Buildkite only uses RSA at present
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.validate_nbf = true;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let decoded = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .context("token validation failed")?;

        let claims = decoded.claims;
        claims.validate_registered()?;
        claims.pipeline.validate(&self.expected_organization_slug)?;

        Ok(claims.into_identity())
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Authenticate the request bearer. On success the verified claims are added
/// to the request extensions and the audit record is marked authorized; on
/// failure the audit record carries the reason and the client receives a
/// bare 401.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let audit = request
        .extensions()
        .get::<AuditHandle>()
        .cloned()
        .unwrap_or_default();

    let Some(token) = bearer_token(request.headers()) else {
        audit.append_error("JWT authorization failure: missing or malformed Authorization header");
        return unauthorized();
    };
    let token = token.to_owned();

    match state.verifier.verify(&token).await {
        Ok(claims) => {
            audit.record_identity(&claims);
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(err) => {
            audit.append_error(&format!("JWT authorization failure: {err:#}"));
            unauthorized()
        }
    }
}

/// Extract the bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "JWT is invalid\n",
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testsupport;

    fn test_verifier() -> TokenVerifier {
        let cfg = AuthorizationConfig {
            audience: testsupport::TEST_AUDIENCE.to_string(),
            organization_slug: testsupport::TEST_ORGANIZATION.to_string(),
            issuer_url: testsupport::TEST_ISSUER.to_string(),
            jwks_static: Some(testsupport::jwks_document()),
        };
        TokenVerifier::new(&cfg, reqwest::Client::new()).unwrap()
    }

    // ── bearer_token ─────────────────────────────────────────────────

    #[test]
    fn bearer_token_extracts_value() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn bearer_token_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer token".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("token"));
    }

    #[test]
    fn bearer_token_rejects_missing_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcjpwdw==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn bearer_token_rejects_empty_value() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    // ── Verification ─────────────────────────────────────────────────

    #[tokio::test]
    async fn verifies_valid_token() {
        let token = testsupport::sign_token(&testsupport::valid_claims());
        let identity = test_verifier().verify(&token).await.unwrap();

        assert_eq!(identity.pipeline.organization_slug, "org-a");
        assert_eq!(identity.pipeline.pipeline_slug, "p1");
        assert_eq!(identity.pipeline.pipeline_id, "p1-uuid");
        assert_eq!(identity.subject, "organization:org-a:pipeline:p1");
        assert_eq!(identity.issuer, testsupport::TEST_ISSUER);
    }

    #[tokio::test]
    async fn rejects_garbage_token() {
        let err = test_verifier().verify("not-a-jwt").await.unwrap_err();
        assert!(err.to_string().contains("malformed token"));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let mut claims = testsupport::valid_claims();
        let now = chrono::Utc::now().timestamp();
        claims["exp"] = serde_json::json!(now - 600);

        let token = testsupport::sign_token(&claims);
        let err = test_verifier().verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("token validation failed"));
    }

    #[tokio::test]
    async fn rejects_wrong_audience() {
        let mut claims = testsupport::valid_claims();
        claims["aud"] = serde_json::json!("someone-else");

        let token = testsupport::sign_token(&claims);
        assert!(test_verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn rejects_wrong_issuer() {
        let mut claims = testsupport::valid_claims();
        claims["iss"] = serde_json::json!("https://rogue.example.com");

        let token = testsupport::sign_token(&claims);
        assert!(test_verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn rejects_missing_pipeline_claims() {
        let mut claims = testsupport::valid_claims();
        claims.as_object_mut().unwrap().remove("pipeline_id");

        let token = testsupport::sign_token(&claims);
        let err = test_verifier().verify(&token).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("missing expected claim(s): pipeline_id"));
    }

    #[tokio::test]
    async fn rejects_other_organization() {
        let mut claims = testsupport::valid_claims();
        claims["organization_slug"] = serde_json::json!("org-b");

        let token = testsupport::sign_token(&claims);
        let err = test_verifier().verify(&token).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("expecting token issued for organization org-a"));
    }

    #[tokio::test]
    async fn rejects_token_signed_by_unknown_key() {
        // header kid differs from the configured key set
        let claims = testsupport::valid_claims();
        let mut header = jsonwebtoken::Header::new(Algorithm::RS256);
        header.kid = Some("unknown".to_string());
        let key =
            jsonwebtoken::EncodingKey::from_rsa_pem(testsupport::TEST_PRIVATE_KEY_PEM.as_bytes())
                .unwrap();
        let token = jsonwebtoken::encode(&header, &claims, &key).unwrap();

        let err = test_verifier().verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("no key found for kid unknown"));
    }
}
