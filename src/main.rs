mod audit;
mod auth;
mod config;
mod credential;
mod forge;
mod http;
mod server;
mod vendor;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::middleware::TokenVerifier;
use crate::config::Config;
use crate::forge::buildkite::PipelineDirectory;
use crate::forge::github::InstallationTokenClient;
use crate::forge::signer::{AssertionSigner, KmsSigner, LocalKeySigner};
use crate::vendor::audited::Auditor;
use crate::vendor::cached::{CachedVendor, DEFAULT_TTL};
use crate::vendor::{PipelineTokenVendor, TokenVendor};

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub vendor: Arc<dyn TokenVendor>,
    pub verifier: Arc<TokenVerifier>,
    pub max_request_bytes: usize,
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn build_state(cfg: &Config) -> Result<AppState> {
    let http_client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(cfg.server.outgoing_max_idle_conns)
        .build()
        .context("failed to build outbound HTTP client")?;

    let verifier = TokenVerifier::new(&cfg.authorization, http_client.clone())
        .context("authorizer configuration failed")?;

    let signer: Arc<dyn AssertionSigner> =
        match (&cfg.github.private_key, &cfg.github.private_key_arn) {
            (Some(pem), None) => {
                Arc::new(LocalKeySigner::from_pem(pem).context("github configuration failed")?)
            }
            (None, Some(key_arn)) => Arc::new(
                KmsSigner::new(key_arn.clone())
                    .await
                    .context("github configuration failed")?,
            ),
            _ => bail!("exactly one of GITHUB_APP_PRIVATE_KEY or GITHUB_APP_PRIVATE_KEY_ARN must be set"),
        };

    let directory = Arc::new(PipelineDirectory::new(&cfg.buildkite, http_client.clone())
        .context("buildkite configuration failed")?);
    let installations = Arc::new(
        InstallationTokenClient::new(&cfg.github, http_client, signer)
            .context("github configuration failed")?,
    );

    // audit outermost so cache hits are recorded like misses
    let vendor = Arc::new(Auditor::new(Arc::new(CachedVendor::new(
        Arc::new(PipelineTokenVendor::new(directory, installations)),
        DEFAULT_TTL,
    ))));

    Ok(AppState {
        vendor,
        verifier: Arc::new(verifier),
        max_request_bytes: cfg.server.max_request_bytes,
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "build information"
    );

    let cfg = Config::from_env().context("configuration load failed")?;

    let state = build_state(&cfg).await?;
    let app = http::handler::router(state);

    server::serve(&cfg.server, app, Vec::new()).await
}
