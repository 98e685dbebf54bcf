//! Pipeline lookup against the Buildkite REST API.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::config::BuildkiteConfig;
use crate::vendor::RepositoryDirectory;

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Resolves `(organization, pipeline)` to the pipeline's configured
/// repository URL. No caching happens at this layer.
#[derive(Debug)]
pub struct PipelineDirectory {
    http: reqwest::Client,
    api_url: Url,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct Pipeline {
    repository: Option<String>,
}

impl PipelineDirectory {
    pub fn new(cfg: &BuildkiteConfig, http: reqwest::Client) -> Result<Self> {
        if cfg.api_token.is_empty() {
            bail!("token must be configured for Buildkite API access");
        }

        let mut api_url = cfg.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let api_url = Url::parse(&api_url).context("could not parse Buildkite API URL")?;

        Ok(Self {
            http,
            api_url,
            api_token: cfg.api_token.clone(),
        })
    }
}

#[async_trait]
impl RepositoryDirectory for PipelineDirectory {
    async fn repository_for_pipeline(
        &self,
        organization_slug: &str,
        pipeline_slug: &str,
    ) -> Result<String> {
        let url = self
            .api_url
            .join(&format!(
                "v2/organizations/{organization_slug}/pipelines/{pipeline_slug}"
            ))
            .context("could not build pipeline URL")?;

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| {
                format!("failed to get pipeline {organization_slug}/{pipeline_slug}")
            })?;

        if !response.status().is_success() {
            bail!(
                "failed to get pipeline {organization_slug}/{pipeline_slug}: status {}",
                response.status()
            );
        }

        let pipeline: Pipeline = response.json().await.with_context(|| {
            format!("could not parse pipeline {organization_slug}/{pipeline_slug}")
        })?;

        pipeline
            .repository
            .filter(|repository| !repository.is_empty())
            .ok_or_else(|| {
                anyhow!("no configured repository for pipeline {organization_slug}/{pipeline_slug}")
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
