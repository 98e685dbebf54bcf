//! Axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /token`           - vend a token for the caller's pipeline, as JSON
//! - `POST /git-credentials` - vend a token in git credential-helper format
//! - `GET  /healthcheck`     - liveness probe, outside audit and auth
//!
//! Failure responses carry only the generic status text so that upstream
//! details never reach the client; the specifics land on the audit record.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use crate::audit::AuditHandle;
use crate::auth::claims::IdentityClaims;
use crate::credential::{codec, PropertyMap};
use crate::AppState;

/// Ceiling on draining a request body for connection reuse.
const MAX_BODY_DRAIN_BYTES: usize = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the router. The token endpoints run behind the body-size limiter,
/// the audit recorder and the bearer verifier, in that order; the health
/// endpoint stays outside all of them.
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/token", post(handle_post_token))
        .route("/git-credentials", post(handle_post_git_credentials))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::middleware::authenticate,
        ))
        .layer(axum::middleware::from_fn(crate::audit::middleware))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            limit_request_body,
        ))
        .with_state(state);

    Router::new()
        .route("/healthcheck", get(handle_healthcheck))
        .merge(authenticated)
}

/// Cap how much of the request body can be read. The failure surfaces when a
/// handler reads past the limit, which keeps over-sized requests visible to
/// the audit record.
async fn limit_request_body(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let limited = Body::new(http_body_util::Limited::new(body, state.max_request_bytes));
    next.run(Request::from_parts(parts, limited)).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /token`
///
/// Vends a token for the authenticated pipeline's own repository and returns
/// it as JSON.
async fn handle_post_token(State(state): State<AppState>, request: Request) -> Response {
    let audit = audit_handle(&request);
    let claims = identity_claims(&request);

    match state.vendor.vend(&audit, &claims.pipeline, "").await {
        Ok(Some(token)) => (StatusCode::OK, Json(token)).into_response(),
        Ok(None) => {
            // unreachable for an empty requested repository; treat as a
            // vendor fault rather than leak an empty success
            status_text(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "token creation failed");
            status_text(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `POST /git-credentials`
///
/// Reads credential-helper properties naming a repository, and answers with
/// credential properties for it. A repository the pipeline cannot vend for
/// yields an empty success so the helper chain can continue.
async fn handle_post_git_credentials(
    State(state): State<AppState>,
    request: Request,
) -> Response {
    let audit = audit_handle(&request);
    let claims = identity_claims(&request);

    // Buffer the whole (limited) body up front: this both feeds the parser
    // and drains the connection for reuse on every exit path.
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_DRAIN_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            if is_length_limit_error(&err) {
                audit.append_error("request body too large");
            } else {
                audit.append_error(&format!("failed to read request body: {err}"));
            }
            return status_text(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let requested = match codec::read_properties(body.as_ref()) {
        Ok(properties) => properties,
        Err(err) => {
            audit.append_error(&format!("reading repository properties failed: {err}"));
            return status_text(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let requested_repo_url = match codec::construct_repository_url(&requested) {
        Ok(url) => url,
        Err(err) => {
            audit.append_error(&format!("{err:#}"));
            return status_text(StatusCode::BAD_REQUEST);
        }
    };

    let token = match state
        .vendor
        .vend(&audit, &claims.pipeline, &requested_repo_url)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "token creation failed");
            return status_text(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    // repository mismatch: a deliberately empty success
    let Some(token) = token else {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())
            .unwrap_or_else(|_| status_text(StatusCode::INTERNAL_SERVER_ERROR));
    };

    let token_url = match token.url() {
        Ok(url) => url,
        Err(err) => {
            audit.append_error(&format!("{err:#}"));
            return status_text(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut properties = PropertyMap::with_capacity(6);
    properties.set("protocol", token_url.scheme());
    properties.set("host", host_with_port(&token_url));
    properties.set("path", token_url.path().trim_start_matches('/'));
    properties.set("username", "x-access-token");
    properties.set("password", token.token.as_str());
    properties.set("password_expiry_utc", token.expiry_unix());

    let mut body = Vec::new();
    if let Err(err) = codec::write_properties(&properties, &mut body) {
        audit.append_error(&format!("writing credential properties failed: {err:#}"));
        return status_text(StatusCode::INTERNAL_SERVER_ERROR);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

/// `GET /healthcheck`
async fn handle_healthcheck() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "OK",
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn audit_handle(request: &Request) -> AuditHandle {
    request
        .extensions()
        .get::<AuditHandle>()
        .cloned()
        .unwrap_or_default()
}

/// The verifier installs the claims; their absence means the middleware
/// chain is miswired, which no response can paper over.
fn identity_claims(request: &Request) -> IdentityClaims {
    request
        .extensions()
        .get::<IdentityClaims>()
        .cloned()
        .expect("identity claims not present on request, authentication middleware missing")
}

fn host_with_port(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_length_limit_error(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// A response carrying only the status line text, e.g. `Bad Request\n`.
fn status_text(status: StatusCode) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{}\n", status.canonical_reason().unwrap_or("Error")),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::middleware::TokenVerifier;
    use crate::auth::testsupport;
    use crate::config::AuthorizationConfig;
    use crate::vendor::audited::Auditor;
    use crate::vendor::testsupport::{repository_token, ScriptedVendor};
    use crate::vendor::TokenVendor;
    use futures::FutureExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    const REPO: &str = "https://github.com/org-a/p1.git";

    fn test_app(vendor: Arc<dyn TokenVendor>) -> Router {
        let cfg = AuthorizationConfig {
            audience: testsupport::TEST_AUDIENCE.to_string(),
            organization_slug: testsupport::TEST_ORGANIZATION.to_string(),
            issuer_url: testsupport::TEST_ISSUER.to_string(),
            jwks_static: Some(testsupport::jwks_document()),
        };
        let state = AppState {
            vendor,
            verifier: Arc::new(TokenVerifier::new(&cfg, reqwest::Client::new()).unwrap()),
            max_request_bytes: 20 * 1024,
        };
        router(state)
    }

    fn vending_app() -> Router {
        test_app(Arc::new(Auditor::new(Arc::new(ScriptedVendor::returning(
            Some(repository_token(REPO)),
        )))))
    }

    fn bearer() -> String {
        format!(
            "Bearer {}",
            testsupport::sign_token(&testsupport::valid_claims())
        )
    }

    fn request(method: &str, uri: &str, body: impl Into<Body>) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, bearer())
            .body(body.into())
            .unwrap()
    }

    fn with_audit(mut request: Request, audit: &AuditHandle) -> Request {
        request.extensions_mut().insert(audit.clone());
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // ── /token ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn post_token_returns_token_json() {
        let response = vending_app()
            .oneshot(request("POST", "/token", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "organizationSlug": "org-a",
                "pipelineSlug": "p1",
                "repositoryUrl": REPO,
                "token": "ghs_abc",
                "expiry": "2024-05-07T17:59:36Z",
            })
        );
    }

    #[tokio::test]
    async fn post_token_hides_vendor_failure_details() {
        let app = test_app(Arc::new(Auditor::new(Arc::new(ScriptedVendor::failing()))));

        let response = app
            .oneshot(request("POST", "/token", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Internal Server Error\n");
    }

    #[tokio::test]
    async fn post_token_without_bearer_is_unauthorized() {
        let req = Request::builder()
            .method("POST")
            .uri("/token")
            .body(Body::empty())
            .unwrap();

        let response = vending_app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "JWT is invalid\n");
    }

    #[tokio::test]
    async fn post_token_with_invalid_bearer_is_unauthorized_and_audited() {
        let audit = AuditHandle::default();
        let req = Request::builder()
            .method("POST")
            .uri("/token")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();

        let response = vending_app()
            .oneshot(with_audit(req, &audit))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "JWT is invalid\n");

        let record = audit.snapshot();
        assert!(record.emitted);
        assert!(!record.authorized);
        assert_eq!(record.status, 401);
        assert!(record.error.starts_with("JWT authorization failure"));
    }

    #[tokio::test]
    async fn authorized_request_is_audited_with_identity() {
        let audit = AuditHandle::default();
        let response = vending_app()
            .oneshot(with_audit(request("POST", "/token", Body::empty()), &audit))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let record = audit.snapshot();
        assert!(record.authorized);
        assert_eq!(record.auth_subject, "organization:org-a:pipeline:p1");
        assert_eq!(record.auth_issuer, testsupport::TEST_ISSUER);
        assert_eq!(record.repositories, vec![REPO]);
        assert_eq!(record.permissions, vec!["contents:read"]);
    }

    // ── /git-credentials ─────────────────────────────────────────────

    #[tokio::test]
    async fn git_credentials_emits_credential_properties() {
        let body = "protocol=https\nhost=github.com\npath=org-a/p1.git\n\n";
        let response = vending_app()
            .oneshot(request("POST", "/git-credentials", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(
            body_string(response).await,
            "protocol=https\nhost=github.com\npath=org-a/p1.git\n\
             username=x-access-token\npassword=ghs_abc\n\
             password_expiry_utc=1715104776\n\n"
        );
    }

    #[tokio::test]
    async fn git_credentials_mismatch_is_empty_success() {
        let audit = AuditHandle::default();
        let app = test_app(Arc::new(Auditor::new(Arc::new(ScriptedVendor::returning(
            None,
        )))));

        let body = "protocol=https\nhost=github.com\npath=org-a/other.git\n\n";
        let response = app
            .oneshot(with_audit(request("POST", "/git-credentials", body), &audit))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "0"
        );
        assert_eq!(body_string(response).await, "");
        assert_eq!(
            audit.snapshot().error,
            "repository mismatch, no token vended"
        );
    }

    #[tokio::test]
    async fn git_credentials_missing_field_is_bad_request() {
        let audit = AuditHandle::default();
        let body = "protocol=https\nhost=github.com\n\n";
        let response = vending_app()
            .oneshot(with_audit(request("POST", "/git-credentials", body), &audit))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Bad Request\n");

        let record = audit.snapshot();
        assert_eq!(record.status, 400);
        assert!(record.error.contains("path must be present"));
    }

    #[tokio::test]
    async fn git_credentials_oversize_body_is_internal_error() {
        let audit = AuditHandle::default();
        let body = vec![b'a'; 21 * 1024];
        let response = vending_app()
            .oneshot(with_audit(
                request("POST", "/git-credentials", body),
                &audit,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Internal Server Error\n");

        let record = audit.snapshot();
        assert_eq!(record.status, 500);
        assert!(record.error.contains("too large"));
    }

    // ── Claims requirement ───────────────────────────────────────────

    #[tokio::test]
    async fn handlers_panic_without_claims() {
        // a router wired without the authentication middleware is a
        // deployment fault, not a request error
        let state = AppState {
            vendor: Arc::new(ScriptedVendor::returning(None)),
            verifier: Arc::new(
                TokenVerifier::new(
                    &AuthorizationConfig {
                        audience: testsupport::TEST_AUDIENCE.to_string(),
                        organization_slug: testsupport::TEST_ORGANIZATION.to_string(),
                        issuer_url: testsupport::TEST_ISSUER.to_string(),
                        jwks_static: Some(testsupport::jwks_document()),
                    },
                    reqwest::Client::new(),
                )
                .unwrap(),
            ),
            max_request_bytes: 20 * 1024,
        };
        let app = Router::new()
            .route("/token", post(handle_post_token))
            .with_state(state);

        let req = Request::builder()
            .method("POST")
            .uri("/token")
            .body(Body::empty())
            .unwrap();

        let result = std::panic::AssertUnwindSafe(app.oneshot(req))
            .catch_unwind()
            .await;
        assert!(result.is_err());
    }

    // ── /healthcheck ─────────────────────────────────────────────────

    #[tokio::test]
    async fn healthcheck_requires_no_bearer() {
        let req = Request::builder()
            .method("GET")
            .uri("/healthcheck")
            .body(Body::empty())
            .unwrap();

        let response = vending_app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }
}
