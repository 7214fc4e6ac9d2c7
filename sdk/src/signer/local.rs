//! Local Ed25519 signer.
//!
//! Seeded from a base64 32-byte secret key. The signer id is derived from the
//! public key so that two processes seeded with the same key agree on it:
//! `local-ed25519:<hex of the first 4 bytes of SHA256(pubkey)>`.

use {
    super::{SignatureRecord, Signer, SignerError},
    crate::{canonical::sha256, registry::decode_any_base64},
    async_trait::async_trait,
    base64::{engine::general_purpose, Engine as _},
    ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey},
    rand::RngCore as _,
};

#[derive(Clone)]
pub struct LocalEd25519Signer {
    signing: SigningKey,
    signer_id: String,
}

impl LocalEd25519Signer {
    /// Generate a fresh random signer (tests and `kernel keygen`).
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    pub fn from_signing_key(signing: SigningKey) -> Self {
        let signer_id = derive_signer_id(&signing.verifying_key());
        Self { signing, signer_id }
    }

    /// Parse a base64 (standard or url-safe, padded or not) 32-byte seed.
    pub fn from_base64_seed(raw: &str) -> Result<Self, SignerError> {
        let trimmed = raw.trim();
        let bytes = decode_any_base64(trimmed)
            .ok_or_else(|| SignerError::InvalidKey("not valid base64".into()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SignerError::InvalidKey(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Raw 32-byte public key, as it appears in a signer registry entry.
    pub fn public_key_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.signing.verifying_key().to_bytes())
    }

    /// Base64 of the 32-byte seed, as consumed by `KERNEL_SIGNER_KEY_B64`.
    pub fn seed_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.signing.to_bytes())
    }
}

fn derive_signer_id(key: &VerifyingKey) -> String {
    let digest = sha256(key.to_bytes().as_ref());
    format!("local-ed25519:{}", hex::encode(&digest[..4]))
}

#[async_trait]
impl Signer for LocalEd25519Signer {
    async fn sign(&self, payload: &[u8]) -> Result<SignatureRecord, SignerError> {
        let sig: Signature = self.signing.sign(payload);
        Ok(SignatureRecord {
            signature: general_purpose::STANDARD.encode(sig.to_bytes()),
            signer_id: self.signer_id.clone(),
        })
    }

    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        signer_id: &str,
    ) -> Result<bool, SignerError> {
        if signer_id != self.signer_id {
            return Ok(false);
        }
        let bytes = decode_any_base64(signature)
            .ok_or_else(|| SignerError::InvalidSignature("not valid base64".into()))?;
        let sig_bytes: [u8; 64] = bytes.try_into().map_err(|v: Vec<u8>| {
            SignerError::InvalidSignature(format!("expected 64 bytes, got {}", v.len()))
        })?;
        let sig = Signature::from_bytes(&sig_bytes);
        Ok(self
            .signing
            .verifying_key()
            .verify_strict(payload, &sig)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_verify_roundtrip() {
        let signer = LocalEd25519Signer::generate();
        let record = signer.sign(b"payload").await.unwrap();
        assert!(signer
            .verify(b"payload", &record.signature, &record.signer_id)
            .await
            .unwrap());
        assert!(!signer
            .verify(b"other", &record.signature, &record.signer_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn seed_roundtrip_preserves_identity() {
        let signer = LocalEd25519Signer::generate();
        let reparsed = LocalEd25519Signer::from_base64_seed(&signer.seed_b64()).unwrap();
        assert_eq!(signer.signer_id(), reparsed.signer_id());
    }

    #[test]
    fn signer_id_shape() {
        let signer = LocalEd25519Signer::from_signing_key(SigningKey::from_bytes(&[7u8; 32]));
        let id = signer.signer_id();
        let suffix = id.strip_prefix("local-ed25519:").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_wrong_seed_length() {
        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            LocalEd25519Signer::from_base64_seed(&short),
            Err(SignerError::InvalidKey(_))
        ));
    }
}
