//! In-memory ledger used by tests and dev mode.
//!
//! The append mutex is the single-writer discipline here: it is held across
//! the signer round-trip, which is exactly the serialization the Postgres
//! store gets from its tail lock.

use {
    super::{
        chain_digest, AppendOutcome, AppendRequest, AuditEvent, AuditPolicy, AuditStore, KeepAll,
        PolicyDecision, StreamResult, StreamStatus, MAX_STREAM_ATTEMPTS,
    },
    crate::{canonical::canonical_bytes, error::StoreError, signer::Signer},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    std::sync::Arc,
    tokio::sync::Mutex,
    uuid::Uuid,
};

pub struct MemoryAuditStore {
    signer: Arc<dyn Signer>,
    policy: Arc<dyn AuditPolicy>,
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self::with_policy(signer, Arc::new(KeepAll))
    }

    pub fn with_policy(signer: Arc<dyn Signer>, policy: Arc<dyn AuditPolicy>) -> Self {
        Self {
            signer,
            policy,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Number of persisted rows.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError> {
        if self.policy.evaluate(&request.event_type, &request.payload) == PolicyDecision::Sample {
            return Ok(AppendOutcome::Sampled);
        }

        let canonical = canonical_bytes(&request.payload)?;
        let mut events = self.events.lock().await;

        if let Some(tail) = events.last() {
            if tail.event_type == request.event_type
                && canonical_bytes(&tail.payload)? == canonical
            {
                return Ok(AppendOutcome::Unchanged(tail.clone()));
            }
        }

        let prev_hash = events.last().map(|t| t.hash.clone()).unwrap_or_default();
        let digest = chain_digest(&canonical, &prev_hash)?;
        let record = self.signer.sign(&digest).await?;

        let event = AuditEvent {
            id: Uuid::new_v4(),
            event_type: request.event_type,
            payload: request.payload,
            metadata: request.metadata,
            ts: Utc::now(),
            prev_hash,
            hash: hex::encode(digest),
            signature: record.signature,
            signer_id: record.signer_id,
            stream_status: StreamStatus::Pending,
            stream_attempts: 0,
            last_stream_attempt_at: None,
            last_stream_error: None,
            archived_key: None,
            archived_at: None,
        };
        events.push(event.clone());
        Ok(AppendOutcome::Appended(event))
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, StoreError> {
        Ok(self.events.lock().await.iter().find(|e| e.id == id).cloned())
    }

    async fn head(&self) -> Result<Option<AuditEvent>, StoreError> {
        Ok(self.events.lock().await.last().cloned())
    }

    async fn list_ordered(
        &self,
        after: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|e| after.map_or(true, |cutoff| e.ts > cutoff))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_stream_batch(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError> {
        let mut events = self.events.lock().await;
        let mut claimed = Vec::new();
        for event in events.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if matches!(
                event.stream_status,
                StreamStatus::Pending | StreamStatus::Retry
            ) {
                event.stream_status = StreamStatus::InProgress;
                event.stream_attempts += 1;
                event.last_stream_attempt_at = Some(Utc::now());
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_streamed(&self, id: Uuid, result: StreamResult) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;

        match result {
            StreamResult::Complete { archived_key } => {
                event.stream_status = StreamStatus::Complete;
                event.archived_key = archived_key;
                event.archived_at = Some(Utc::now());
                event.last_stream_error = None;
            }
            StreamResult::Failed { error } => {
                event.stream_status = if event.stream_attempts >= MAX_STREAM_ATTEMPTS {
                    StreamStatus::Failed
                } else {
                    StreamStatus::Retry
                };
                event.last_stream_error = Some(error);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
