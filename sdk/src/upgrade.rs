//! Quorum-gated upgrade pipeline.
//!
//! An upgrade manifest is submitted, collects approver signatures, and can
//! only be applied once `required_approvals` distinct members of the
//! configured approver set have signed the canonical manifest digest. Every
//! transition lands in the audit ledger, in order: `upgrade.submitted`, one
//! `upgrade.approval` per approval, then `upgrade.applied` or
//! `upgrade.rejected`.

use {
    crate::{
        audit::{AppendRequest, AuditStore},
        canonical::canonical_digest,
        config::UpgradeConfig,
        error::{KernelError, StoreError},
        manifest::{ManifestRegistry, ManifestSignature},
        registry::SignerRegistry,
        signer::Signer,
    },
    async_trait::async_trait,
    base64::{engine::general_purpose, Engine as _},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::{json, Value},
    sqlx::{PgPool, Row as _},
    std::{collections::HashMap, sync::Arc},
    tokio::sync::Mutex,
    uuid::Uuid,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
}

impl UpgradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub approver_id: String,
    pub signature: String,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub upgrade_id: Uuid,
    pub manifest: Value,
    pub status: UpgradeStatus,
    pub approvals: Vec<Approval>,
    pub required_approvals: u32,
    pub approver_set: Vec<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl UpgradeRequest {
    /// Distinct approvals from configured approvers.
    pub fn quorum_count(&self) -> u32 {
        self.approvals
            .iter()
            .filter(|a| self.approver_set.iter().any(|id| id == &a.approver_id))
            .count() as u32
    }

    pub fn quorum(&self) -> Vec<&str> {
        self.approvals
            .iter()
            .filter(|a| self.approver_set.iter().any(|id| id == &a.approver_id))
            .map(|a| a.approver_id.as_str())
            .collect()
    }
}

#[async_trait]
pub trait UpgradeStore: Send + Sync {
    async fn insert(&self, upgrade: UpgradeRequest) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<UpgradeRequest>, StoreError>;
    async fn update(&self, upgrade: &UpgradeRequest) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryUpgradeStore {
    upgrades: Mutex<HashMap<Uuid, UpgradeRequest>>,
}

impl MemoryUpgradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpgradeStore for MemoryUpgradeStore {
    async fn insert(&self, upgrade: UpgradeRequest) -> Result<(), StoreError> {
        let mut upgrades = self.upgrades.lock().await;
        if upgrades.contains_key(&upgrade.upgrade_id) {
            return Err(StoreError::Conflict(format!(
                "upgrade {} already exists",
                upgrade.upgrade_id
            )));
        }
        upgrades.insert(upgrade.upgrade_id, upgrade);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UpgradeRequest>, StoreError> {
        Ok(self.upgrades.lock().await.get(&id).cloned())
    }

    async fn update(&self, upgrade: &UpgradeRequest) -> Result<(), StoreError> {
        let mut upgrades = self.upgrades.lock().await;
        match upgrades.get_mut(&upgrade.upgrade_id) {
            Some(slot) => {
                *slot = upgrade.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

/// Postgres store: the full request is the JSONB payload, status and
/// timestamps ride along as key columns.
pub struct PgUpgradeStore {
    pool: PgPool,
}

impl PgUpgradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpgradeStore for PgUpgradeStore {
    async fn insert(&self, upgrade: UpgradeRequest) -> Result<(), StoreError> {
        let payload =
            serde_json::to_value(&upgrade).map_err(|e| StoreError::Encoding(e.to_string()))?;
        sqlx::query(
            "INSERT INTO upgrades (id, status, payload, submitted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(upgrade.upgrade_id)
        .bind(upgrade.status.as_str())
        .bind(payload)
        .bind(upgrade.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UpgradeRequest>, StoreError> {
        let row = sqlx::query("SELECT payload FROM upgrades WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let payload: Value = row.try_get("payload")?;
            serde_json::from_value(payload).map_err(|e| StoreError::Encoding(e.to_string()))
        })
        .transpose()
    }

    async fn update(&self, upgrade: &UpgradeRequest) -> Result<(), StoreError> {
        let payload =
            serde_json::to_value(upgrade).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let updated = sqlx::query("UPDATE upgrades SET status = $2, payload = $3 WHERE id = $1")
            .bind(upgrade.upgrade_id)
            .bind(upgrade.status.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Enforces N-of-M approvals and emits the audit/manifest records for each
/// transition.
pub struct QuorumEngine {
    store: Arc<dyn UpgradeStore>,
    audit: Arc<dyn AuditStore>,
    manifests: Arc<dyn ManifestRegistry>,
    signer: Arc<dyn Signer>,
    approver_keys: SignerRegistry,
    config: UpgradeConfig,
}

impl QuorumEngine {
    pub fn new(
        store: Arc<dyn UpgradeStore>,
        audit: Arc<dyn AuditStore>,
        manifests: Arc<dyn ManifestRegistry>,
        signer: Arc<dyn Signer>,
        approver_keys: SignerRegistry,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            store,
            audit,
            manifests,
            signer,
            approver_keys,
            config,
        }
    }

    pub async fn submit(
        &self,
        manifest: Value,
        submitted_by: &str,
    ) -> Result<UpgradeRequest, KernelError> {
        if !manifest.is_object() {
            return Err(KernelError::invalid_input(
                "invalid_manifest",
                "upgrade manifest must be a JSON object",
            ));
        }

        let upgrade = UpgradeRequest {
            upgrade_id: Uuid::new_v4(),
            manifest,
            status: UpgradeStatus::Pending,
            approvals: Vec::new(),
            required_approvals: self.config.required_approvals,
            approver_set: self.config.approver_ids.clone(),
            submitted_by: submitted_by.to_string(),
            submitted_at: Utc::now(),
            applied_at: None,
        };
        self.store.insert(upgrade.clone()).await?;

        self.audit
            .append(AppendRequest::new(
                "upgrade.submitted",
                json!({
                    "upgradeId": upgrade.upgrade_id,
                    "submittedBy": upgrade.submitted_by,
                    "requiredApprovals": upgrade.required_approvals,
                    "manifestDigest": hex::encode(canonical_digest(&upgrade.manifest)?),
                }),
            ))
            .await?;

        Ok(upgrade)
    }

    pub async fn approve(
        &self,
        id: Uuid,
        approver_id: &str,
        signature: &str,
    ) -> Result<UpgradeRequest, KernelError> {
        let mut upgrade = self
            .store
            .get(id)
            .await?
            .ok_or(KernelError::NotFound("upgrade"))?;

        if !matches!(
            upgrade.status,
            UpgradeStatus::Pending | UpgradeStatus::Approved
        ) {
            return Err(KernelError::conflict(
                "upgrade_not_pending",
                format!("upgrade is {}", upgrade.status.as_str()),
            ));
        }

        if !upgrade.approver_set.iter().any(|a| a == approver_id) {
            return Err(KernelError::Forbidden);
        }

        if upgrade.approvals.iter().any(|a| a.approver_id == approver_id) {
            return Err(KernelError::conflict(
                "duplicate_approval",
                format!("'{approver_id}' has already approved"),
            ));
        }

        let entry = self.approver_keys.get(approver_id).ok_or_else(|| {
            KernelError::invalid_input(
                "approver_key_unknown",
                format!("no registered key for approver '{approver_id}'"),
            )
        })?;

        let digest = canonical_digest(&upgrade.manifest)?;
        let sig_bytes = general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| {
                KernelError::invalid_input("invalid_approval_signature", "signature is not base64")
            })?;
        if !entry.verify(&digest, &sig_bytes) {
            return Err(KernelError::invalid_input(
                "invalid_approval_signature",
                "signature does not verify over the canonical manifest",
            ));
        }

        upgrade.approvals.push(Approval {
            approver_id: approver_id.to_string(),
            signature: signature.to_string(),
            ts: Utc::now(),
        });
        if upgrade.quorum_count() >= upgrade.required_approvals {
            upgrade.status = UpgradeStatus::Approved;
        }
        self.store.update(&upgrade).await?;

        self.audit
            .append(AppendRequest::new(
                "upgrade.approval",
                json!({
                    "upgradeId": upgrade.upgrade_id,
                    "approverId": approver_id,
                    "approvals": upgrade.quorum_count(),
                    "required": upgrade.required_approvals,
                }),
            ))
            .await?;

        Ok(upgrade)
    }

    pub async fn apply(
        &self,
        id: Uuid,
        applied_by: &str,
    ) -> Result<(UpgradeRequest, ManifestSignature), KernelError> {
        let mut upgrade = self
            .store
            .get(id)
            .await?
            .ok_or(KernelError::NotFound("upgrade"))?;

        match upgrade.status {
            UpgradeStatus::Pending | UpgradeStatus::Approved => {}
            UpgradeStatus::Applied => {
                return Err(KernelError::conflict(
                    "upgrade_already_applied",
                    "upgrade has already been applied",
                ))
            }
            UpgradeStatus::Rejected => {
                return Err(KernelError::conflict(
                    "upgrade_rejected",
                    "upgrade has been rejected",
                ))
            }
        }

        let approvals = upgrade.quorum_count();
        if approvals < upgrade.required_approvals {
            return Err(KernelError::InsufficientQuorum {
                approvals,
                required: upgrade.required_approvals,
            });
        }

        // The Kernel counter-signs the manifest it is about to activate.
        let digest = canonical_digest(&upgrade.manifest)?;
        let record = self.signer.sign(&digest).await?;
        let manifest_id = upgrade
            .manifest
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| upgrade.upgrade_id.to_string());
        let version = upgrade
            .manifest
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        let signature = self
            .manifests
            .insert(ManifestSignature::new(manifest_id, record, version))
            .await?;

        upgrade.status = UpgradeStatus::Applied;
        upgrade.applied_at = Some(Utc::now());
        self.store.update(&upgrade).await?;

        self.audit
            .append(AppendRequest::new(
                "upgrade.applied",
                json!({
                    "upgradeId": upgrade.upgrade_id,
                    "appliedBy": applied_by,
                    "manifestSignatureId": signature.id,
                    "quorum": upgrade.quorum(),
                }),
            ))
            .await?;

        Ok((upgrade, signature))
    }

    pub async fn reject(
        &self,
        id: Uuid,
        rejected_by: &str,
    ) -> Result<UpgradeRequest, KernelError> {
        let mut upgrade = self
            .store
            .get(id)
            .await?
            .ok_or(KernelError::NotFound("upgrade"))?;

        if matches!(
            upgrade.status,
            UpgradeStatus::Applied | UpgradeStatus::Rejected
        ) {
            return Err(KernelError::conflict(
                "upgrade_not_pending",
                format!("upgrade is {}", upgrade.status.as_str()),
            ));
        }

        upgrade.status = UpgradeStatus::Rejected;
        self.store.update(&upgrade).await?;

        self.audit
            .append(AppendRequest::new(
                "upgrade.rejected",
                json!({
                    "upgradeId": upgrade.upgrade_id,
                    "rejectedBy": rejected_by,
                }),
            ))
            .await?;

        Ok(upgrade)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<UpgradeRequest>, KernelError> {
        Ok(self.store.get(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            audit::MemoryAuditStore,
            manifest::MemoryManifestRegistry,
            signer::LocalEd25519Signer,
        },
        assert_matches::assert_matches,
        ed25519_dalek::{Signer as _, SigningKey},
    };

    fn approver_key(byte: u8) -> SigningKey {
        SigningKey::from_bytes(&[byte; 32])
    }

    fn approval_signature(sk: &SigningKey, manifest: &Value) -> String {
        let digest = canonical_digest(manifest).unwrap();
        general_purpose::STANDARD.encode(sk.sign(&digest).to_bytes())
    }

    struct Fixture {
        engine: QuorumEngine,
        audit: Arc<MemoryAuditStore>,
        manifests: Arc<MemoryManifestRegistry>,
        keys: HashMap<String, SigningKey>,
    }

    fn fixture(required: u32) -> Fixture {
        let approver_ids = ["alice", "bob", "carol", "dave", "erin"];
        let mut registry = SignerRegistry::default();
        let mut keys = HashMap::new();
        for (i, id) in approver_ids.iter().enumerate() {
            let sk = approver_key(i as u8 + 1);
            registry.insert_ed25519(*id, sk.verifying_key());
            keys.insert(id.to_string(), sk);
        }

        let signer = Arc::new(LocalEd25519Signer::generate());
        let audit = Arc::new(MemoryAuditStore::new(signer.clone()));
        let manifests = Arc::new(MemoryManifestRegistry::new());
        let engine = QuorumEngine::new(
            Arc::new(MemoryUpgradeStore::new()),
            audit.clone(),
            manifests.clone(),
            signer,
            registry,
            UpgradeConfig {
                approver_ids: approver_ids.iter().map(|s| s.to_string()).collect(),
                required_approvals: required,
            },
        );

        Fixture {
            engine,
            audit,
            manifests,
            keys,
        }
    }

    fn manifest() -> Value {
        json!({"id": "upgrade-m1", "version": "2.0.0", "target": "ai-infra"})
    }

    #[tokio::test]
    async fn three_of_five_quorum_flow() {
        let fx = fixture(3);
        let manifest = manifest();

        let upgrade = fx.engine.submit(manifest.clone(), "operator-1").await.unwrap();
        assert_eq!(upgrade.status, UpgradeStatus::Pending);

        for approver in ["alice", "bob"] {
            let sig = approval_signature(&fx.keys[approver], &manifest);
            fx.engine
                .approve(upgrade.upgrade_id, approver, &sig)
                .await
                .unwrap();
        }

        // Two approvals is below quorum.
        let err = fx
            .engine
            .apply(upgrade.upgrade_id, "operator-1")
            .await
            .unwrap_err();
        assert_matches!(
            err,
            KernelError::InsufficientQuorum {
                approvals: 2,
                required: 3
            }
        );

        let sig = approval_signature(&fx.keys["carol"], &manifest);
        let approved = fx
            .engine
            .approve(upgrade.upgrade_id, "carol", &sig)
            .await
            .unwrap();
        assert_eq!(approved.status, UpgradeStatus::Approved);

        let (applied, signature) = fx
            .engine
            .apply(upgrade.upgrade_id, "operator-1")
            .await
            .unwrap();
        assert_eq!(applied.status, UpgradeStatus::Applied);
        assert!(applied.applied_at.is_some());
        assert_eq!(applied.quorum(), vec!["alice", "bob", "carol"]);
        assert_eq!(signature.manifest_id, "upgrade-m1");
        assert_eq!(signature.version.as_deref(), Some("2.0.0"));

        // The registry holds the kernel counter-signature.
        assert_eq!(fx.manifests.list("upgrade-m1").await.unwrap().len(), 1);

        // Audit trail: submitted, three approvals, applied — in order.
        let events = fx.audit.list_ordered(None, 100).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "upgrade.submitted",
                "upgrade.approval",
                "upgrade.approval",
                "upgrade.approval",
                "upgrade.applied",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_approver_is_forbidden() {
        let fx = fixture(3);
        let manifest = manifest();
        let upgrade = fx.engine.submit(manifest.clone(), "op").await.unwrap();

        let outsider = approver_key(99);
        let sig = approval_signature(&outsider, &manifest);
        assert_matches!(
            fx.engine
                .approve(upgrade.upgrade_id, "mallory", &sig)
                .await
                .unwrap_err(),
            KernelError::Forbidden
        );
    }

    #[tokio::test]
    async fn duplicate_approval_conflicts() {
        let fx = fixture(3);
        let manifest = manifest();
        let upgrade = fx.engine.submit(manifest.clone(), "op").await.unwrap();

        let sig = approval_signature(&fx.keys["alice"], &manifest);
        fx.engine
            .approve(upgrade.upgrade_id, "alice", &sig)
            .await
            .unwrap();

        assert_matches!(
            fx.engine
                .approve(upgrade.upgrade_id, "alice", &sig)
                .await
                .unwrap_err(),
            KernelError::Conflict {
                code: "duplicate_approval",
                ..
            }
        );
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let fx = fixture(3);
        let manifest = manifest();
        let upgrade = fx.engine.submit(manifest.clone(), "op").await.unwrap();

        // Signed over a different manifest.
        let sig = approval_signature(&fx.keys["alice"], &json!({"id": "other"}));
        assert_matches!(
            fx.engine
                .approve(upgrade.upgrade_id, "alice", &sig)
                .await
                .unwrap_err(),
            KernelError::InvalidInput {
                code: "invalid_approval_signature",
                ..
            }
        );
    }

    #[tokio::test]
    async fn apply_is_single_shot() {
        let fx = fixture(1);
        let manifest = manifest();
        let upgrade = fx.engine.submit(manifest.clone(), "op").await.unwrap();

        let sig = approval_signature(&fx.keys["alice"], &manifest);
        fx.engine
            .approve(upgrade.upgrade_id, "alice", &sig)
            .await
            .unwrap();
        fx.engine.apply(upgrade.upgrade_id, "op").await.unwrap();

        assert_matches!(
            fx.engine.apply(upgrade.upgrade_id, "op").await.unwrap_err(),
            KernelError::Conflict {
                code: "upgrade_already_applied",
                ..
            }
        );
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let fx = fixture(1);
        let manifest = manifest();
        let upgrade = fx.engine.submit(manifest.clone(), "op").await.unwrap();

        fx.engine.reject(upgrade.upgrade_id, "op").await.unwrap();

        let sig = approval_signature(&fx.keys["alice"], &manifest);
        assert_matches!(
            fx.engine
                .approve(upgrade.upgrade_id, "alice", &sig)
                .await
                .unwrap_err(),
            KernelError::Conflict { .. }
        );
        assert_matches!(
            fx.engine.apply(upgrade.upgrade_id, "op").await.unwrap_err(),
            KernelError::Conflict {
                code: "upgrade_rejected",
                ..
            }
        );

        let events = fx.audit.list_ordered(None, 100).await.unwrap();
        assert_eq!(
            events.last().unwrap().event_type,
            "upgrade.rejected".to_string()
        );
    }
}
