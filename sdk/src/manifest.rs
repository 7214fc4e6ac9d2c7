//! Manifest signature records.
//!
//! One row per manifest-signing event. The row id is the correlation key the
//! audit event that follows embeds as `manifestSignatureId`, so audits link
//! to the signed object without duplicating signature bytes.

use {
    crate::{error::StoreError, signer::SignatureRecord},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sqlx::{postgres::PgRow, PgPool, Row as _},
    tokio::sync::Mutex,
    uuid::Uuid,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSignature {
    pub id: Uuid,
    pub manifest_id: String,
    pub signer_id: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub ts: DateTime<Utc>,
}

impl ManifestSignature {
    pub fn new(
        manifest_id: impl Into<String>,
        record: SignatureRecord,
        version: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest_id: manifest_id.into(),
            signer_id: record.signer_id,
            signature: record.signature,
            version,
            ts: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ManifestRegistry: Send + Sync {
    /// Persist one signing event. Rows are immutable.
    async fn insert(&self, signature: ManifestSignature) -> Result<ManifestSignature, StoreError>;

    /// All signatures for a manifest, ordered by `ts` ascending.
    async fn list(&self, manifest_id: &str) -> Result<Vec<ManifestSignature>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ManifestSignature>, StoreError>;
}

#[derive(Default)]
pub struct MemoryManifestRegistry {
    rows: Mutex<Vec<ManifestSignature>>,
}

impl MemoryManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestRegistry for MemoryManifestRegistry {
    async fn insert(&self, signature: ManifestSignature) -> Result<ManifestSignature, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.id == signature.id) {
            return Err(StoreError::Conflict(format!(
                "manifest signature {} already exists",
                signature.id
            )));
        }
        rows.push(signature.clone());
        Ok(signature)
    }

    async fn list(&self, manifest_id: &str) -> Result<Vec<ManifestSignature>, StoreError> {
        let rows = self.rows.lock().await;
        let mut matching: Vec<ManifestSignature> = rows
            .iter()
            .filter(|r| r.manifest_id == manifest_id)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.ts);
        Ok(matching)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ManifestSignature>, StoreError> {
        Ok(self.rows.lock().await.iter().find(|r| r.id == id).cloned())
    }
}

pub struct PgManifestRegistry {
    pool: PgPool,
}

impl PgManifestRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ManifestRegistry for PgManifestRegistry {
    async fn insert(&self, signature: ManifestSignature) -> Result<ManifestSignature, StoreError> {
        sqlx::query(
            "INSERT INTO manifest_signatures (id, manifest_id, signer_id, signature, version, ts) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(signature.id)
        .bind(&signature.manifest_id)
        .bind(&signature.signer_id)
        .bind(&signature.signature)
        .bind(&signature.version)
        .bind(signature.ts)
        .execute(&self.pool)
        .await?;
        Ok(signature)
    }

    async fn list(&self, manifest_id: &str) -> Result<Vec<ManifestSignature>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, manifest_id, signer_id, signature, version, ts \
               FROM manifest_signatures WHERE manifest_id = $1 ORDER BY ts ASC",
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(signature_from_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<ManifestSignature>, StoreError> {
        sqlx::query(
            "SELECT id, manifest_id, signer_id, signature, version, ts \
               FROM manifest_signatures WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| signature_from_row(&row))
        .transpose()
    }
}

fn signature_from_row(row: &PgRow) -> Result<ManifestSignature, StoreError> {
    Ok(ManifestSignature {
        id: row.try_get("id")?,
        manifest_id: row.try_get("manifest_id")?,
        signer_id: row.try_get("signer_id")?,
        signature: row.try_get("signature")?,
        version: row.try_get("version")?,
        ts: row.try_get("ts")?,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::signer::SignatureRecord};

    fn record(signer_id: &str) -> SignatureRecord {
        SignatureRecord {
            signature: "c2ln".into(),
            signer_id: signer_id.into(),
        }
    }

    #[tokio::test]
    async fn lists_signatures_for_a_manifest_in_ts_order() {
        let registry = MemoryManifestRegistry::new();

        let a = ManifestSignature::new("m1", record("signer-a"), None);
        let b = ManifestSignature::new("m1", record("signer-b"), Some("2".into()));
        let other = ManifestSignature::new("m2", record("signer-a"), None);

        registry.insert(b.clone()).await.unwrap();
        registry.insert(a.clone()).await.unwrap();
        registry.insert(other).await.unwrap();

        let listed = registry.list("m1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ts <= listed[1].ts);
        assert!(listed.iter().all(|s| s.manifest_id == "m1"));
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let registry = MemoryManifestRegistry::new();
        let sig = ManifestSignature::new("m1", record("signer-a"), None);
        registry.insert(sig.clone()).await.unwrap();
        assert!(matches!(
            registry.insert(sig).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn get_by_correlation_id() {
        let registry = MemoryManifestRegistry::new();
        let sig = ManifestSignature::new("m1", record("signer-a"), None);
        registry.insert(sig.clone()).await.unwrap();
        assert_eq!(registry.get(sig.id).await.unwrap(), Some(sig));
        assert_eq!(registry.get(Uuid::new_v4()).await.unwrap(), None);
    }
}
