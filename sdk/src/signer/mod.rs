//! Signing capability abstraction.
//!
//! A [`Signer`] produces `(signature, signer_id)` over an arbitrary byte
//! payload and can verify the inverse. Three variants exist:
//! - [`KmsSigner`] fronts the KMS/HSM signing proxy over HTTP,
//! - [`LocalEd25519Signer`] signs with a locally held Ed25519 key,
//! - [`HmacDevSigner`] is the deterministic development fallback.
//!
//! The variant is selected once at startup by [`build_signer`]. Under the
//! fail-closed policy (production + `REQUIRE_SIGNING_PROXY=1`) any proxy
//! failure aborts the caller; no fallback is consulted.

mod dev;
mod kms;
mod local;

pub use {dev::HmacDevSigner, kms::KmsSigner, local::LocalEd25519Signer};

use {
    crate::config::{RuntimeEnv, SigningConfig},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    thiserror::Error,
};

pub const DEV_SIGNER_ID: &str = "dev-hmac";

/// The output of a signing operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureRecord {
    /// Base64 signature bytes (hex for the dev HMAC variant).
    pub signature: String,
    /// Identity the verifier resolves to a public key.
    pub signer_id: String,
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("signing proxy returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("signing proxy rejected the request (status {status})")]
    Rejected { status: u16 },
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("signer configuration error: {0}")]
    Config(String),
    #[error("signing proxy transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Capability set every signer variant implements.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `payload`, returning the signature and the authoritative signer id.
    async fn sign(&self, payload: &[u8]) -> Result<SignatureRecord, SignerError>;

    /// Verify `signature` over `payload` for `signer_id`.
    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        signer_id: &str,
    ) -> Result<bool, SignerError>;
}

/// Select and construct the process signer from configuration.
///
/// Resolution order:
/// 1. a configured proxy endpoint wins (with a dev-only fallback signer wired
///    in unless fail-closed),
/// 2. a local Ed25519 seed,
/// 3. the dev HMAC secret, outside production only.
///
/// With `REQUIRE_SIGNING_PROXY=1` and no endpoint the process must not start.
pub fn build_signer(cfg: &SigningConfig, env: RuntimeEnv) -> Result<Arc<dyn Signer>, SignerError> {
    if env.is_production() && cfg.dev_secret.is_some() {
        return Err(SignerError::Config(
            "REPOWRITER_SIGNING_SECRET must be unset in production".into(),
        ));
    }

    if let Some(endpoint) = cfg.proxy_url.as_deref() {
        let fail_closed = cfg.require_proxy;
        let fallback: Option<Arc<dyn Signer>> = if fail_closed || env.is_production() {
            None
        } else if let Some(seed) = cfg.local_key_b64.as_deref() {
            Some(Arc::new(LocalEd25519Signer::from_base64_seed(seed)?) as Arc<dyn Signer>)
        } else {
            cfg.dev_secret
                .as_deref()
                .map(|secret| Arc::new(HmacDevSigner::new(secret)) as Arc<dyn Signer>)
        };

        let signer = KmsSigner::new(endpoint, cfg, fail_closed, fallback)?;
        return Ok(Arc::new(signer));
    }

    if cfg.require_proxy {
        return Err(SignerError::Unavailable(
            "REQUIRE_SIGNING_PROXY is set but no signing proxy endpoint is configured".into(),
        ));
    }

    if let Some(seed) = cfg.local_key_b64.as_deref() {
        let signer = LocalEd25519Signer::from_base64_seed(seed)?;
        if env.is_production() {
            log::warn!(
                "production is running on the local ed25519 signer ({})",
                signer.signer_id()
            );
        }
        return Ok(Arc::new(signer));
    }

    match (&cfg.dev_secret, env.is_production()) {
        (Some(secret), false) => {
            log::warn!("signing with the deterministic dev HMAC signer");
            Ok(Arc::new(HmacDevSigner::new(secret)))
        }
        _ => Err(SignerError::Config(
            "no signer configured: set SIGNING_PROXY_URL, KERNEL_SIGNER_KEY_B64 \
             or REPOWRITER_SIGNING_SECRET"
                .into(),
        )),
    }
}
