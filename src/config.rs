//! Environment-driven configuration.
//!
//! Every setting comes from the process environment; defaults follow the
//! deployment conventions of the bridge. `Config::from_env` fails with a
//! single human-readable error when a required value is absent or malformed.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub authorization: AuthorizationConfig,
    pub buildkite: BuildkiteConfig,
    pub github: GithubConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port for the HTTP server.
    pub port: u16,
    /// How long in-flight requests may take to drain after a shutdown signal.
    pub shutdown_timeout_secs: u64,
    /// Ceiling on the request body size.
    pub max_request_bytes: usize,
    /// Idle connection cap for the outbound HTTP pool.
    pub outgoing_max_idle_conns: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    25
}

fn default_max_request_bytes() -> usize {
    20 * 1024
}

fn default_outgoing_max_idle_conns() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthorizationConfig {
    /// Audience the bearer must be issued for.
    pub audience: String,
    /// The only Buildkite organization tokens are accepted from.
    pub organization_slug: String,
    /// Issuer URL; also the base for the well-known key-set location.
    pub issuer_url: String,
    /// Static JWKS document overriding the remote key set (testing).
    pub jwks_static: Option<String>,
}

fn default_audience() -> String {
    "app-token-issuer".to_string()
}

fn default_issuer_url() -> String {
    "https://agent.buildkite.com".to_string()
}

// ---------------------------------------------------------------------------
// Buildkite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BuildkiteConfig {
    /// API token used for pipeline lookups.
    pub api_token: String,
    /// API base URL; overridable for testing.
    pub api_url: String,
}

fn default_buildkite_api_url() -> String {
    "https://api.buildkite.com".to_string()
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API base URL; overridable for testing.
    pub api_url: String,
    /// GitHub App id, used as the assertion issuer.
    pub app_id: u64,
    /// Installation the tokens are minted for.
    pub installation_id: u64,
    /// PEM-encoded app private key. Exactly one of this and
    /// `private_key_arn` must be configured.
    pub private_key: Option<String>,
    /// KMS key identifier for remote signing.
    pub private_key_arn: Option<String>,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

impl Config {
    pub fn from_env() -> Result<Config> {
        let config = Config {
            server: ServerConfig {
                port: parsed_or("SERVER_PORT", default_port())?,
                shutdown_timeout_secs: parsed_or(
                    "SERVER_SHUTDOWN_TIMEOUT_SECS",
                    default_shutdown_timeout_secs(),
                )?,
                max_request_bytes: parsed_or(
                    "SERVER_MAX_REQUEST_BYTES",
                    default_max_request_bytes(),
                )?,
                outgoing_max_idle_conns: parsed_or(
                    "SERVER_OUTGOING_MAX_IDLE_CONNS",
                    default_outgoing_max_idle_conns(),
                )?,
            },
            authorization: AuthorizationConfig {
                audience: optional("JWT_AUDIENCE").unwrap_or_else(default_audience),
                organization_slug: required("JWT_BUILDKITE_ORGANIZATION_SLUG")?,
                issuer_url: optional("JWT_ISSUER_URL").unwrap_or_else(default_issuer_url),
                jwks_static: optional("JWT_JWKS_STATIC"),
            },
            buildkite: BuildkiteConfig {
                api_token: required("BUILDKITE_API_TOKEN")?,
                api_url: optional("BUILDKITE_API_URL").unwrap_or_else(default_buildkite_api_url),
            },
            github: GithubConfig {
                api_url: optional("GITHUB_API_URL").unwrap_or_else(default_github_api_url),
                app_id: parsed_required("GITHUB_APP_ID")?,
                installation_id: parsed_required("GITHUB_APP_INSTALLATION_ID")?,
                private_key: optional("GITHUB_APP_PRIVATE_KEY"),
                private_key_arn: optional("GITHUB_APP_PRIVATE_KEY_ARN"),
            },
        };

        validate_config(&config)?;
        Ok(config)
    }
}

/// Sanity checks that span more than a single variable.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.github.private_key.is_some() != config.github.private_key_arn.is_some(),
        "exactly one of GITHUB_APP_PRIVATE_KEY or GITHUB_APP_PRIVATE_KEY_ARN must be set"
    );
    anyhow::ensure!(
        config.server.max_request_bytes > 0,
        "SERVER_MAX_REQUEST_BYTES must be positive"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment access
// ---------------------------------------------------------------------------

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn required(name: &str) -> Result<String> {
    optional(name).ok_or_else(|| anyhow!("{name} must be set"))
}

fn parsed_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|err| anyhow!("invalid {name}: {err}")),
        None => Ok(default),
    }
}

fn parsed_required<T>(name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = required(name)?;
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(err) => bail!("invalid {name}: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
