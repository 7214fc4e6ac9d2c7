//! The Kernel orchestrator.
//!
//! Thin coordination layer binding the canonicalizer, signer, stores and
//! quorum engine into the documented operation contracts. Every mutation
//! follows the same shape: canonicalize the manifest, sign its digest,
//! persist the manifest signature, persist domain state, then append the
//! audit event that references the `manifestSignatureId`.

use {
    crate::{
        audit::{AppendOutcome, AppendRequest, AuditEvent, AuditStore},
        canonical::canonical_digest,
        config::UpgradeConfig,
        entity::{EntityKind, EntityRecord, EntityStore},
        error::KernelError,
        manifest::{ManifestRegistry, ManifestSignature},
        registry::SignerRegistry,
        signer::Signer,
        upgrade::{QuorumEngine, UpgradeStore},
    },
    chrono::Utc,
    serde_json::{json, Value},
    std::sync::Arc,
    uuid::Uuid,
};

pub struct Kernel {
    signer: Arc<dyn Signer>,
    audit: Arc<dyn AuditStore>,
    manifests: Arc<dyn ManifestRegistry>,
    entities: Arc<dyn EntityStore>,
    upgrades: QuorumEngine,
}

impl Kernel {
    pub fn new(
        signer: Arc<dyn Signer>,
        audit: Arc<dyn AuditStore>,
        manifests: Arc<dyn ManifestRegistry>,
        entities: Arc<dyn EntityStore>,
        upgrade_store: Arc<dyn UpgradeStore>,
        approver_keys: SignerRegistry,
        upgrade_config: UpgradeConfig,
    ) -> Self {
        let upgrades = QuorumEngine::new(
            upgrade_store,
            audit.clone(),
            manifests.clone(),
            signer.clone(),
            approver_keys,
            upgrade_config,
        );
        Self {
            signer,
            audit,
            manifests,
            entities,
            upgrades,
        }
    }

    pub fn upgrades(&self) -> &QuorumEngine {
        &self.upgrades
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    /// Sign a manifest and persist the signature row plus its audit event.
    pub async fn sign_manifest(
        &self,
        manifest: &Value,
        version: Option<String>,
    ) -> Result<ManifestSignature, KernelError> {
        if !manifest.is_object() {
            return Err(KernelError::invalid_input(
                "invalid_manifest",
                "manifest must be a JSON object",
            ));
        }

        let digest = canonical_digest(manifest)?;
        let record = self.signer.sign(&digest).await?;

        let manifest_id = manifest
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let signature = self
            .manifests
            .insert(ManifestSignature::new(manifest_id, record, version))
            .await?;

        self.audit
            .append(AppendRequest::new(
                "manifest.signed",
                json!({
                    "manifestId": signature.manifest_id,
                    "manifestSignatureId": signature.id,
                    "signerId": signature.signer_id,
                    "version": signature.version,
                }),
            ))
            .await?;

        Ok(signature)
    }

    pub async fn list_manifest_signatures(
        &self,
        manifest_id: &str,
    ) -> Result<Vec<ManifestSignature>, KernelError> {
        Ok(self.manifests.list(manifest_id).await?)
    }

    /// Append a caller-supplied audit event.
    pub async fn record_audit(
        &self,
        event_type: &str,
        payload: Value,
        metadata: Option<Value>,
    ) -> Result<AppendOutcome, KernelError> {
        if event_type.trim().is_empty() {
            return Err(KernelError::invalid_input(
                "invalid_event_type",
                "eventType must be non-empty",
            ));
        }

        let mut request = AppendRequest::new(event_type, payload);
        if let Some(metadata) = metadata {
            request = request.with_metadata(metadata);
        }
        Ok(self.audit.append(request).await?)
    }

    pub async fn get_audit(&self, id: Uuid) -> Result<Option<AuditEvent>, KernelError> {
        Ok(self.audit.get(id).await?)
    }

    /// Persist a domain record: sign its canonical form, store it, and emit
    /// the audit event referencing the new id and `manifestSignatureId`.
    pub async fn create_entity(
        &self,
        kind: EntityKind,
        payload: Value,
        created_by: &str,
    ) -> Result<(EntityRecord, ManifestSignature), KernelError> {
        let Value::Object(mut fields) = payload else {
            return Err(KernelError::invalid_input(
                "invalid_payload",
                format!("{} payload must be a JSON object", kind.noun()),
            ));
        };

        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // The signed manifest always carries the id it was assigned.
        fields.insert("id".to_string(), Value::String(id.clone()));
        let payload = Value::Object(fields);

        let digest = canonical_digest(&payload)?;
        let record = self.signer.sign(&digest).await?;
        let signature = self
            .manifests
            .insert(ManifestSignature::new(id.clone(), record, None))
            .await?;

        let entity = self
            .entities
            .insert(EntityRecord {
                id: id.clone(),
                kind,
                payload,
                created_at: Utc::now(),
            })
            .await?;

        self.audit
            .append(AppendRequest::new(
                kind.created_event(),
                json!({
                    "id": entity.id,
                    "manifestSignatureId": signature.id,
                    "createdBy": created_by,
                }),
            ))
            .await?;

        Ok((entity, signature))
    }

    pub async fn get_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<EntityRecord>, KernelError> {
        Ok(self.entities.get(kind, id).await?)
    }

    /// Readiness probe: the ledger (and database, when configured) must
    /// answer.
    pub async fn ready(&self) -> Result<(), KernelError> {
        Ok(self.audit.ping().await?)
    }

    /// Best-effort `signer.error` audit; failures here are logged, never
    /// surfaced, since the signer is already known to be degraded.
    pub async fn note_signer_error(&self, context: &str, detail: &str) {
        let outcome = self
            .audit
            .append(AppendRequest::new(
                "signer.error",
                json!({"context": context, "detail": detail}),
            ))
            .await;
        if let Err(err) = outcome {
            log::warn!("could not record signer.error audit: {err}");
        }
    }
}
