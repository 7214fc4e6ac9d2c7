//! Offline end-to-end ledger verification.
//!
//! Replays the chain in `ts` order and re-checks, per event:
//! 1. `prev_hash` linkage to the previous row (empty at genesis),
//! 2. `hash = hex(SHA256(canonical(payload) ‖ hexdecode(prev_hash)))`,
//! 3. the signature, resolved through the signer registry: Ed25519 verifies
//!    over the hash bytes; RSA-SHA256 verifies over
//!    `canonical(payload) ‖ prev_hash_bytes` (PSS preferred, PKCS#1
//!    tolerated); dev HMAC signatures verify only when the dev secret is
//!    supplied.
//!
//! Verification is fail-stop: the first broken invariant is reported and
//! nothing after it is trusted.

use {
    crate::{
        audit::{chain_digest, AuditEvent},
        canonical::canonical_bytes,
        registry::{decode_any_base64, KeyAlgorithm, SignerRegistry},
        signer::DEV_SIGNER_ID,
    },
    hmac::{Hmac, Mac as _},
    sha2::Sha256,
    thiserror::Error,
    uuid::Uuid,
};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("event {index} ({id}): prev_hash mismatch (expected '{expected}', found '{found}')")]
    PrevHashMismatch {
        index: u64,
        id: Uuid,
        expected: String,
        found: String,
    },
    #[error("event {index} ({id}): hash mismatch (stored '{stored}', computed '{computed}')")]
    HashMismatch {
        index: u64,
        id: Uuid,
        stored: String,
        computed: String,
    },
    #[error("event {index} ({id}): no registry entry for signer '{signer_id}'")]
    UnknownSigner {
        index: u64,
        id: Uuid,
        signer_id: String,
    },
    #[error("event {index} ({id}): signature does not verify under '{signer_id}'")]
    SignatureInvalid {
        index: u64,
        id: Uuid,
        signer_id: String,
    },
    #[error("event {index} ({id}): {message}")]
    Malformed {
        index: u64,
        id: Uuid,
        message: String,
    },
}

/// Result of a complete, successful verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSummary {
    pub count: u64,
    pub head_hash: String,
}

/// Incremental verifier; feed events in `ts` ascending order.
pub struct ChainVerifier {
    registry: SignerRegistry,
    dev_secret: Option<String>,
    prev_hash: String,
    count: u64,
}

impl ChainVerifier {
    pub fn new(registry: SignerRegistry, dev_secret: Option<String>) -> Self {
        Self {
            registry,
            dev_secret,
            prev_hash: String::new(),
            count: 0,
        }
    }

    pub fn verify_event(&mut self, event: &AuditEvent) -> Result<(), VerifyError> {
        let index = self.count;
        let id = event.id;
        let malformed = |message: String| VerifyError::Malformed { index, id, message };

        if event.prev_hash != self.prev_hash {
            return Err(VerifyError::PrevHashMismatch {
                index,
                id,
                expected: self.prev_hash.clone(),
                found: event.prev_hash.clone(),
            });
        }

        let canonical = canonical_bytes(&event.payload)
            .map_err(|e| malformed(format!("payload does not canonicalize: {e}")))?;
        let digest = chain_digest(&canonical, &event.prev_hash)
            .map_err(|e| malformed(e.to_string()))?;
        let computed = hex::encode(digest);
        if computed != event.hash {
            return Err(VerifyError::HashMismatch {
                index,
                id,
                stored: event.hash.clone(),
                computed,
            });
        }

        self.verify_signature(event, &canonical, &digest, index)?;

        self.prev_hash = event.hash.clone();
        self.count += 1;
        Ok(())
    }

    fn verify_signature(
        &self,
        event: &AuditEvent,
        canonical: &[u8],
        digest: &[u8; 32],
        index: u64,
    ) -> Result<(), VerifyError> {
        let id = event.id;
        let invalid = || VerifyError::SignatureInvalid {
            index,
            id,
            signer_id: event.signer_id.clone(),
        };

        if event.signer_id == DEV_SIGNER_ID {
            let Some(secret) = &self.dev_secret else {
                return Err(VerifyError::UnknownSigner {
                    index,
                    id,
                    signer_id: event.signer_id.clone(),
                });
            };
            let claimed = hex::decode(&event.signature).map_err(|_| invalid())?;
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key size");
            mac.update(digest);
            return mac.verify_slice(&claimed).map_err(|_| invalid());
        }

        let Some(entry) = self.registry.get(&event.signer_id) else {
            return Err(VerifyError::UnknownSigner {
                index,
                id,
                signer_id: event.signer_id.clone(),
            });
        };

        let sig_bytes = decode_any_base64(&event.signature).ok_or_else(invalid)?;

        let verified = match entry.algorithm {
            // Ed25519 signs the 32 hash bytes.
            KeyAlgorithm::Ed25519 => entry.verify(digest, &sig_bytes),
            // RSA signs the full preimage.
            KeyAlgorithm::RsaSha256 => {
                let mut preimage = canonical.to_vec();
                if !event.prev_hash.is_empty() {
                    preimage.extend_from_slice(
                        &hex::decode(&event.prev_hash).expect("validated above"),
                    );
                }
                entry.verify(&preimage, &sig_bytes)
            }
        };

        if verified {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    /// The verified head, once every event has been fed through.
    pub fn finish(self) -> ChainSummary {
        ChainSummary {
            count: self.count,
            head_hash: self.prev_hash,
        }
    }
}

/// Verify a full ledger in one call.
pub fn verify_chain<'a>(
    events: impl IntoIterator<Item = &'a AuditEvent>,
    registry: SignerRegistry,
    dev_secret: Option<String>,
) -> Result<ChainSummary, VerifyError> {
    let mut verifier = ChainVerifier::new(registry, dev_secret);
    for event in events {
        verifier.verify_event(event)?;
    }
    Ok(verifier.finish())
}
