//! Claim types carried by the Buildkite agent OIDC token.
//!
//! The wire-level claim names are fixed by the Buildkite agent; see
//! <https://buildkite.com/docs/agent/v3/cli-oidc#claims>.

use anyhow::{bail, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Wire claims
// ---------------------------------------------------------------------------

/// The full claim set of a bearer token, as deserialized during signature
/// verification. Registered claims default to their empty forms so that
/// presence checks can produce precise errors after decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub aud: Audience,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub nbf: i64,
    #[serde(default)]
    pub exp: i64,
    #[serde(flatten)]
    pub pipeline: PipelineClaims,
}

/// The `aud` claim may be a single string or a list on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Default for Audience {
    fn default() -> Self {
        Audience::Many(Vec::new())
    }
}

impl Audience {
    pub fn is_empty(&self) -> bool {
        match self {
            Audience::One(aud) => aud.is_empty(),
            Audience::Many(auds) => auds.is_empty(),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Audience::One(aud) => vec![aud],
            Audience::Many(auds) => auds,
        }
    }
}

/// The additional claims Buildkite includes in the JWT, naming the job the
/// token was issued for.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineClaims {
    #[serde(default)]
    pub organization_slug: String,
    #[serde(default)]
    pub pipeline_slug: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub build_number: u64,
    #[serde(default)]
    pub build_branch: String,
    #[serde(default)]
    pub build_commit: String,
    #[serde(default)]
    pub build_tag: Option<String>,
    #[serde(default)]
    pub step_key: Option<String>,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub agent_id: String,
}

impl Claims {
    /// Ensure the registered claims we rely on are present. The signature
    /// check already enforces the active and expiry instants; this only
    /// ensures the claims exist at all.
    pub fn validate_registered(&self) -> Result<()> {
        if self.aud.is_empty() {
            bail!("audience claim not present");
        }
        if self.iss.is_empty() {
            bail!("issuer claim not present");
        }
        if self.sub.is_empty() {
            bail!("subject claim not present");
        }
        if self.nbf == 0 || self.exp == 0 {
            bail!("token has no validity period");
        }
        Ok(())
    }

    pub fn into_identity(self) -> IdentityClaims {
        IdentityClaims {
            audience: self.aud.into_vec(),
            issuer: self.iss,
            subject: self.sub,
            not_before: self.nbf,
            expiry: self.exp,
            pipeline: self.pipeline,
        }
    }
}

impl PipelineClaims {
    /// Ensure the pipeline claims are present, and that the organization slug
    /// matches the configured value when one is configured.
    pub fn validate(&self, expected_organization_slug: &str) -> Result<()> {
        let fields = [
            ("organization_slug", !self.organization_slug.is_empty()),
            ("pipeline_slug", !self.pipeline_slug.is_empty()),
            ("pipeline_id", !self.pipeline_id.is_empty()),
            ("build_number", self.build_number != 0),
            ("build_branch", !self.build_branch.is_empty()),
            ("build_commit", !self.build_commit.is_empty()),
            // build_tag and step_key may be absent
            ("job_id", !self.job_id.is_empty()),
            ("agent_id", !self.agent_id.is_empty()),
        ];

        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            bail!("missing expected claim(s): {}", missing.join(", "));
        }

        if !expected_organization_slug.is_empty()
            && expected_organization_slug != self.organization_slug
        {
            bail!("expecting token issued for organization {expected_organization_slug}");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Verified identity
// ---------------------------------------------------------------------------

/// The verified identity placed on the request by the authentication
/// middleware. Its presence implies the bearer signature was verified, every
/// required claim is populated, and the organization slug matches the
/// configured expectation.
#[derive(Debug, Clone)]
pub struct IdentityClaims {
    pub audience: Vec<String>,
    pub issuer: String,
    pub subject: String,
    pub not_before: i64,
    pub expiry: i64,
    pub pipeline: PipelineClaims,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
