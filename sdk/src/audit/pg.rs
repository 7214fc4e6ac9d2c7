//! Postgres ledger backend.
//!
//! The append transaction locks the newest row (`ORDER BY ts DESC LIMIT 1
//! FOR UPDATE`) before computing the chain hash, which serializes concurrent
//! writers and keeps the chain strictly linear. Streaming claims use
//! `FOR UPDATE SKIP LOCKED` so parallel workers never hand out the same row
//! twice.

use {
    super::{
        chain_digest, AppendOutcome, AppendRequest, AuditEvent, AuditPolicy, AuditStore, KeepAll,
        PolicyDecision, StreamResult, StreamStatus, MAX_STREAM_ATTEMPTS,
    },
    crate::{canonical::canonical_bytes, error::StoreError, signer::Signer},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{postgres::PgRow, PgPool, Row as _},
    std::sync::Arc,
    tokio_retry::strategy::{jitter, ExponentialBackoff},
    uuid::Uuid,
};

/// Serialization-conflict retries before the error surfaces.
const MAX_CONFLICT_RETRIES: usize = 3;

const EVENT_COLUMNS: &str = "id, event_type, payload, metadata, ts, prev_hash, hash, signature, \
     signer_id, stream_status, stream_attempts, last_stream_attempt_at, last_stream_error, \
     s3_object_key, s3_archived_at";

pub struct PgAuditStore {
    pool: PgPool,
    signer: Arc<dyn Signer>,
    policy: Arc<dyn AuditPolicy>,
}

/// Read the whole ledger ordered by `ts` ascending, without needing a
/// signer. Used by offline tooling (verification, export).
pub async fn fetch_all_ordered(pool: &PgPool) -> Result<Vec<AuditEvent>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM audit_events ORDER BY ts ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(event_from_row).collect()
}

impl PgAuditStore {
    pub fn new(pool: PgPool, signer: Arc<dyn Signer>) -> Self {
        Self::with_policy(pool, signer, Arc::new(KeepAll))
    }

    pub fn with_policy(pool: PgPool, signer: Arc<dyn Signer>, policy: Arc<dyn AuditPolicy>) -> Self {
        Self {
            pool,
            signer,
            policy,
        }
    }

    async fn try_append(&self, request: &AppendRequest) -> Result<AppendOutcome, StoreError> {
        let canonical = canonical_bytes(&request.payload)?;
        let mut tx = self.pool.begin().await?;

        let tail: Option<AuditEvent> = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events ORDER BY ts DESC, id DESC LIMIT 1 FOR UPDATE"
        ))
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| event_from_row(&row))
        .transpose()?;

        if let Some(tail) = &tail {
            if tail.event_type == request.event_type
                && canonical_bytes(&tail.payload)? == canonical
            {
                tx.rollback().await?;
                return Ok(AppendOutcome::Unchanged(tail.clone()));
            }
        }

        let prev_hash = tail.map(|t| t.hash).unwrap_or_default();
        let digest = chain_digest(&canonical, &prev_hash)?;
        let record = self.signer.sign(&digest).await?;

        let event = AuditEvent {
            id: Uuid::new_v4(),
            event_type: request.event_type.clone(),
            payload: request.payload.clone(),
            metadata: request.metadata.clone(),
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

        sqlx::query(
            "INSERT INTO audit_events \
                 (id, event_type, payload, metadata, ts, prev_hash, hash, signature, signer_id, \
                  stream_status, stream_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(event.ts)
        .bind(&event.prev_hash)
        .bind(&event.hash)
        .bind(&event.signature)
        .bind(&event.signer_id)
        .bind(event.stream_status.as_str())
        .bind(event.stream_attempts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AppendOutcome::Appended(event))
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError> {
        if self.policy.evaluate(&request.event_type, &request.payload) == PolicyDecision::Sample {
            return Ok(AppendOutcome::Sampled);
        }

        let mut backoff = ExponentialBackoff::from_millis(50)
            .map(jitter)
            .take(MAX_CONFLICT_RETRIES);

        loop {
            match self.try_append(&request).await {
                Err(StoreError::Database(err)) if is_serialization_conflict(&err) => {
                    match backoff.next() {
                        Some(delay) => {
                            log::debug!("audit append serialization conflict, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(StoreError::Database(err)),
                    }
                }
                other => return other,
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, StoreError> {
        sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| event_from_row(&row))
        .transpose()
    }

    async fn head(&self) -> Result<Option<AuditEvent>, StoreError> {
        sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events ORDER BY ts DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?
        .map(|row| event_from_row(&row))
        .transpose()
    }

    async fn list_ordered(
        &self,
        after: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = match after {
            Some(cutoff) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM audit_events WHERE ts > $1 \
                     ORDER BY ts ASC, id ASC LIMIT $2"
                ))
                .bind(cutoff)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM audit_events ORDER BY ts ASC, id ASC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(event_from_row).collect()
    }

    async fn claim_stream_batch(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE audit_events \
                SET stream_status = 'in_progress', \
                    stream_attempts = stream_attempts + 1, \
                    last_stream_attempt_at = now() \
              WHERE id IN ( \
                    SELECT id FROM audit_events \
                     WHERE stream_status IN ('pending', 'retry') \
                     ORDER BY ts ASC \
                     LIMIT $1 \
                       FOR UPDATE SKIP LOCKED) \
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_streamed(&self, id: Uuid, result: StreamResult) -> Result<(), StoreError> {
        match result {
            StreamResult::Complete { archived_key } => {
                sqlx::query(
                    "UPDATE audit_events \
                        SET stream_status = 'complete', \
                            s3_object_key = $2, \
                            s3_archived_at = now(), \
                            last_stream_error = NULL \
                      WHERE id = $1",
                )
                .bind(id)
                .bind(archived_key)
                .execute(&self.pool)
                .await?;
            }
            StreamResult::Failed { error } => {
                sqlx::query(
                    "UPDATE audit_events \
                        SET stream_status = CASE \
                                WHEN stream_attempts >= $3 THEN 'failed' \
                                ELSE 'retry' \
                            END, \
                            last_stream_error = $2 \
                      WHERE id = $1",
                )
                .bind(id)
                .bind(error)
                .bind(MAX_STREAM_ATTEMPTS)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "40001" || code == "40P01")
}

fn event_from_row(row: &PgRow) -> Result<AuditEvent, StoreError> {
    let status_raw: String = row.try_get("stream_status")?;
    let stream_status = StreamStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Encoding(format!("unknown stream_status '{status_raw}'")))?;

    Ok(AuditEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        ts: row.try_get("ts")?,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
        signature: row.try_get("signature")?,
        signer_id: row.try_get("signer_id")?,
        stream_status,
        stream_attempts: row.try_get("stream_attempts")?,
        last_stream_attempt_at: row.try_get("last_stream_attempt_at")?,
        last_stream_error: row.try_get("last_stream_error")?,
        archived_key: row.try_get("s3_object_key")?,
        archived_at: row.try_get("s3_archived_at")?,
    })
}
