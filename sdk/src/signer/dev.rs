//! Deterministic HMAC-SHA256 development signer.
//!
//! Only selected when no signing proxy is configured, the fail-closed guard
//! is off, and the process is not running in production. Signatures are hex
//! rather than base64 so they are trivially greppable in dev logs.

use {
    super::{SignatureRecord, Signer, SignerError, DEV_SIGNER_ID},
    async_trait::async_trait,
    hmac::{Hmac, Mac as _},
    sha2::Sha256,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct HmacDevSigner {
    secret: Vec<u8>,
}

impl HmacDevSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn tag(&self, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[async_trait]
impl Signer for HmacDevSigner {
    async fn sign(&self, payload: &[u8]) -> Result<SignatureRecord, SignerError> {
        Ok(SignatureRecord {
            signature: hex::encode(self.tag(payload)),
            signer_id: DEV_SIGNER_ID.to_string(),
        })
    }

    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        signer_id: &str,
    ) -> Result<bool, SignerError> {
        if signer_id != DEV_SIGNER_ID {
            return Ok(false);
        }
        let claimed = hex::decode(signature)
            .map_err(|e| SignerError::InvalidSignature(format!("invalid hex: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload);
        Ok(mac.verify_slice(&claimed).is_ok())
    }
}
