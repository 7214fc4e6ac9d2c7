//! Signer registry: `signer_id` → verification key.
//!
//! The registry file is provisioned out-of-band (at deploy time) and loaded
//! by the verifier and by the upgrade quorum engine. Two JSON shapes are
//! accepted: an array of entries, or an object mapping signer ids to key
//! records.
//!
//! Accepted public key encodings:
//! - PEM (`PUBLIC KEY`, or `RSA PUBLIC KEY` for PKCS#1),
//! - base64 PKIX/SPKI DER,
//! - raw 32-byte Ed25519 keys in base64 (equivalent to wrapping them into an
//!   SPKI document; the algorithm defaults to Ed25519 when raw-32 is
//!   detected).

use {
    base64::{engine::general_purpose, Engine as _},
    ed25519_dalek::{Signature, VerifyingKey},
    rsa::{
        pkcs1::DecodeRsaPublicKey as _, pkcs8::DecodePublicKey as _, Pkcs1v15Sign, Pss,
        RsaPublicKey,
    },
    serde::Deserialize,
    sha2::Sha256,
    std::{collections::BTreeMap, fs, path::Path},
    thiserror::Error,
};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo document.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read signer registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid signer registry json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signer '{signer_id}': {message}")]
    InvalidKey { signer_id: String, message: String },
    #[error("unsupported algorithm '{0}' (expected Ed25519 or RSA-SHA256)")]
    UnsupportedAlgorithm(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    RsaSha256,
}

impl KeyAlgorithm {
    fn parse(raw: &str) -> Result<Self, RegistryError> {
        match raw {
            "Ed25519" | "ed25519" => Ok(Self::Ed25519),
            "RSA-SHA256" | "rsa-sha256" | "RSA" => Ok(Self::RsaSha256),
            other => Err(RegistryError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub enum VerificationKey {
    Ed25519(VerifyingKey),
    Rsa(Box<RsaPublicKey>),
}

#[derive(Clone, Debug)]
pub struct RegistryEntry {
    pub algorithm: KeyAlgorithm,
    pub key: VerificationKey,
}

impl RegistryEntry {
    /// Verify `signature` over `message`.
    ///
    /// For RSA the message is hashed with SHA-256 here; PSS is preferred and
    /// PKCS#1 v1.5 is tolerated.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match &self.key {
            VerificationKey::Ed25519(key) => {
                let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
                    return false;
                };
                let sig = Signature::from_bytes(&sig_bytes);
                key.verify_strict(message, &sig).is_ok()
            }
            VerificationKey::Rsa(key) => {
                let hashed = crate::canonical::sha256(message);
                key.verify(Pss::new::<Sha256>(), &hashed, signature).is_ok()
                    || key
                        .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
                        .is_ok()
            }
        }
    }
}

/// Immutable signer-id → key map.
#[derive(Clone, Debug, Default)]
pub struct SignerRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryFile {
    #[serde(alias = "signer_id")]
    signer_id: String,
    #[serde(alias = "public_key")]
    public_key: String,
    algorithm: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    #[serde(alias = "public_key")]
    public_key: String,
    algorithm: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<EntryFile>),
    Map(BTreeMap<String, KeyFile>),
}

impl SignerRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::from_json(&fs::read(path)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_json::from_slice(bytes)?;
        let raw_entries: Vec<(String, String, Option<String>)> = match file {
            RegistryFile::List(list) => list
                .into_iter()
                .map(|e| (e.signer_id, e.public_key, e.algorithm))
                .collect(),
            RegistryFile::Map(map) => map
                .into_iter()
                .map(|(id, k)| (id, k.public_key, k.algorithm))
                .collect(),
        };

        let mut entries = BTreeMap::new();
        for (signer_id, public_key, algorithm) in raw_entries {
            let entry = parse_entry(&signer_id, &public_key, algorithm.as_deref())?;
            entries.insert(signer_id, entry);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, signer_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(signer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn signer_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Test/tooling helper: register a raw Ed25519 key under `signer_id`.
    pub fn insert_ed25519(&mut self, signer_id: impl Into<String>, key: VerifyingKey) {
        self.entries.insert(
            signer_id.into(),
            RegistryEntry {
                algorithm: KeyAlgorithm::Ed25519,
                key: VerificationKey::Ed25519(key),
            },
        );
    }
}

fn parse_entry(
    signer_id: &str,
    public_key: &str,
    algorithm: Option<&str>,
) -> Result<RegistryEntry, RegistryError> {
    let algorithm = algorithm.map(KeyAlgorithm::parse).transpose()?;
    let invalid = |message: String| RegistryError::InvalidKey {
        signer_id: signer_id.to_string(),
        message,
    };

    let trimmed = public_key.trim();
    if trimmed.starts_with("-----BEGIN") {
        return parse_pem(trimmed, algorithm).map_err(invalid);
    }

    let der = decode_any_base64(trimmed).ok_or_else(|| invalid("not valid base64".into()))?;

    if der.len() == 32 {
        // Raw Ed25519 key; same key material an SPKI wrap would carry.
        if algorithm == Some(KeyAlgorithm::RsaSha256) {
            return Err(invalid("raw 32-byte key cannot be RSA".into()));
        }
        let key = VerifyingKey::from_bytes(&der.try_into().expect("length checked"))
            .map_err(|e| invalid(format!("invalid ed25519 key: {e}")))?;
        return Ok(RegistryEntry {
            algorithm: KeyAlgorithm::Ed25519,
            key: VerificationKey::Ed25519(key),
        });
    }

    parse_der(&der, algorithm).map_err(invalid)
}

fn parse_pem(pem: &str, algorithm: Option<KeyAlgorithm>) -> Result<RegistryEntry, String> {
    if pem.contains("RSA PUBLIC KEY") {
        let key =
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| format!("invalid pkcs1 pem: {e}"))?;
        return Ok(RegistryEntry {
            algorithm: KeyAlgorithm::RsaSha256,
            key: VerificationKey::Rsa(Box::new(key)),
        });
    }

    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| format!("invalid pem body: {e}"))?;
    parse_der(&der, algorithm)
}

fn parse_der(der: &[u8], algorithm: Option<KeyAlgorithm>) -> Result<RegistryEntry, String> {
    let looks_ed25519 = der.len() == 44 && der.starts_with(&ED25519_SPKI_PREFIX);

    match algorithm {
        Some(KeyAlgorithm::Ed25519) | None if looks_ed25519 => {
            let raw: [u8; 32] = der[12..].try_into().expect("length checked");
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|e| format!("invalid ed25519 key: {e}"))?;
            Ok(RegistryEntry {
                algorithm: KeyAlgorithm::Ed25519,
                key: VerificationKey::Ed25519(key),
            })
        }
        Some(KeyAlgorithm::Ed25519) => Err("not an ed25519 SubjectPublicKeyInfo".into()),
        _ => {
            let key = RsaPublicKey::from_public_key_der(der)
                .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
                .map_err(|e| format!("invalid rsa key: {e}"))?;
            Ok(RegistryEntry {
                algorithm: KeyAlgorithm::RsaSha256,
                key: VerificationKey::Rsa(Box::new(key)),
            })
        }
    }
}

pub(crate) fn decode_any_base64(raw: &str) -> Option<Vec<u8>> {
    for engine in [
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
        &general_purpose::URL_SAFE,
        &general_purpose::URL_SAFE_NO_PAD,
    ] {
        if let Ok(bytes) = engine.decode(raw) {
            return Some(bytes);
        }
    }
    None
}
