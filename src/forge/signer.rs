//! RS256 assertion signing for the GitHub App.
//!
//! The app authenticates its token requests with a short-lived JWT. The
//! signature is produced either from a private key held in memory or by AWS
//! KMS, so that key material never has to enter the process. Assertions are
//! cheap to produce and short-lived; they are never cached.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{MessageType, SigningAlgorithmSpec};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey};
use sha2::{Digest, Sha256};

/// Allowance for clock drift between this host and GitHub.
const ISSUED_AT_DRIFT_SECS: i64 = 60;

/// Assertion lifetime; GitHub rejects anything above ten minutes.
const ASSERTION_LIFETIME_SECS: i64 = 10 * 60;

// ---------------------------------------------------------------------------
// Signer seam
// ---------------------------------------------------------------------------

/// Produces an RS256 signature over a JWT signing input, returned as
/// unpadded base64-url.
#[async_trait]
pub trait AssertionSigner: Send + Sync {
    async fn sign(&self, signing_input: &[u8]) -> Result<String>;

    /// Signature verification is not needed for minting assertions.
    fn verify(&self, _signing_input: &[u8], _signature: &[u8]) -> Result<()> {
        bail!("signature verification is not supported")
    }
}

// ---------------------------------------------------------------------------
// Local private key
// ---------------------------------------------------------------------------

/// Signs with an RSA private key held in process memory.
pub struct LocalKeySigner {
    key: EncodingKey,
}

impl LocalKeySigner {
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .context("could not parse GitHub App private key")?;
        Ok(Self { key })
    }
}

#[async_trait]
impl AssertionSigner for LocalKeySigner {
    async fn sign(&self, signing_input: &[u8]) -> Result<String> {
        jsonwebtoken::crypto::sign(signing_input, &self.key, Algorithm::RS256)
            .context("RS256 signing failed")
    }
}

// ---------------------------------------------------------------------------
// AWS KMS
// ---------------------------------------------------------------------------

/// Signs through AWS KMS. The signing input is hashed locally so KMS only
/// ever sees a constant-size digest, never the assertion payload.
pub struct KmsSigner {
    client: aws_sdk_kms::Client,
    key_id: String,
}

impl KmsSigner {
    pub async fn new(key_id: impl Into<String>) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::with_client(
            aws_sdk_kms::Client::new(&aws_config),
            key_id,
        ))
    }

    pub fn with_client(client: aws_sdk_kms::Client, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }
}

#[async_trait]
impl AssertionSigner for KmsSigner {
    async fn sign(&self, signing_input: &[u8]) -> Result<String> {
        let digest = Sha256::digest(signing_input);

        let output = self
            .client
            .sign()
            .key_id(&self.key_id)
            .message(Blob::new(digest.to_vec()))
            .message_type(MessageType::Digest)
            .signing_algorithm(SigningAlgorithmSpec::RsassaPkcs1V15Sha256)
            .send()
            .await
            .context("KMS signing failed")?;

        let signature = output
            .signature()
            .ok_or_else(|| anyhow!("KMS returned no signature"))?;

        // the JWT spec requires unpadded base64-url for signatures
        Ok(URL_SAFE_NO_PAD.encode(signature.as_ref()))
    }
}

// ---------------------------------------------------------------------------
// Assertion assembly
// ---------------------------------------------------------------------------

/// Build the signed app assertion presented to the installation-token
/// endpoint.
pub async fn signed_assertion(app_id: u64, signer: &dyn AssertionSigner) -> Result<String> {
    let now = Utc::now().timestamp();

    let header = serde_json::json!({"typ": "JWT", "alg": "RS256"});
    let claims = serde_json::json!({
        "iat": now - ISSUED_AT_DRIFT_SECS,
        "exp": now + ASSERTION_LIFETIME_SECS,
        "iss": app_id.to_string(),
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?),
    );

    let signature = signer.sign(signing_input.as_bytes()).await?;

    Ok(format!("{signing_input}.{signature}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
