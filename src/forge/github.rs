//! GitHub App installation token minting.
//!
//! Given a repository URL, requests an installation access token scoped to
//! that single repository with `contents: read` permission. Each request is
//! authenticated with a freshly signed app assertion.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::http::header;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::config::GithubConfig;
use crate::forge::signer::{signed_assertion, AssertionSigner};
use crate::vendor::AccessTokenIssuer;

/// The only repository host tokens are issued for.
const EXPECTED_REPOSITORY_HOST: &str = "github.com";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct InstallationTokenClient {
    http: reqwest::Client,
    api_url: Url,
    app_id: u64,
    installation_id: u64,
    signer: Arc<dyn AssertionSigner>,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl InstallationTokenClient {
    pub fn new(
        cfg: &GithubConfig,
        http: reqwest::Client,
        signer: Arc<dyn AssertionSigner>,
    ) -> Result<Self> {
        // a URL without a trailing slash would drop its last path segment
        // when joined against
        let mut api_url = cfg.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let api_url = Url::parse(&api_url).context("could not parse GitHub API URL")?;

        Ok(Self {
            http,
            api_url,
            app_id: cfg.app_id,
            installation_id: cfg.installation_id,
            signer,
        })
    }
}

#[async_trait]
impl AccessTokenIssuer for InstallationTokenClient {
    async fn create_access_token(&self, repository_url: &str) -> Result<(String, DateTime<Utc>)> {
        let (_, repository) = repository_name_for_url(repository_url)?;

        let assertion = signed_assertion(self.app_id, self.signer.as_ref())
            .await
            .context("could not sign GitHub App assertion")?;

        let url = self
            .api_url
            .join(&format!(
                "app/installations/{}/access_tokens",
                self.installation_id
            ))
            .context("could not build installation token URL")?;

        let response = self
            .http
            .post(url)
            .bearer_auth(assertion)
            .header(header::ACCEPT, "application/vnd.github+json")
            .json(&serde_json::json!({
                "repositories": [repository],
                "permissions": {"contents": "read"},
            }))
            .send()
            .await
            .context("installation token request failed")?;

        if !response.status().is_success() {
            bail!(
                "installation token request failed with status {}",
                response.status()
            );
        }

        let token: InstallationTokenResponse = response
            .json()
            .await
            .context("could not parse installation token response")?;

        info!(repository = %repository, expiry = %token.expires_at, "installation token issued");

        Ok((token.token, token.expires_at))
    }
}

// ---------------------------------------------------------------------------
// Repository URL handling
// ---------------------------------------------------------------------------

/// Extract `(org, repository)` from a repository URL. Only the expected
/// GitHub host is accepted, a trailing `.git` is stripped, and the path must
/// hold exactly an organization and a repository name.
pub fn repository_name_for_url(repository_url: &str) -> Result<(String, String)> {
    let url = Url::parse(repository_url)
        .with_context(|| format!("invalid repository URL: {repository_url}"))?;

    let host = url.host_str().unwrap_or_default();
    if host != EXPECTED_REPOSITORY_HOST {
        bail!("unexpected repository host: {host}");
    }

    let path = url
        .path()
        .trim_start_matches('/')
        .trim_end_matches(".git");

    match path.split_once('/') {
        Some((org, repository))
            if !org.is_empty() && !repository.is_empty() && !repository.contains('/') =>
        {
            Ok((org.to_string(), repository.to_string()))
        }
        _ => bail!("repository path must name org/repository: {repository_url}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
