//! The hash-chained audit ledger.
//!
//! Every persisted event carries `hash = SHA256(canonical(payload) ‖
//! hexdecode(prev_hash))` where `prev_hash` is the hash of the previous row
//! ordered by `ts`, and a signature over the hash produced by the process
//! signer. Appends serialize on the store's tail lock so the chain never
//! forks.

mod memory;
mod pg;

pub use {
    memory::MemoryAuditStore,
    pg::{fetch_all_ordered, PgAuditStore},
};

use {
    crate::{
        canonical::{sha256, CanonicalError},
        error::StoreError,
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    thiserror::Error,
    uuid::Uuid,
};

/// Streaming gives up and parks a row as `failed` after this many attempts.
pub const MAX_STREAM_ATTEMPTS: i32 = 5;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("prev_hash is not valid hex: {0}")]
    InvalidPrevHash(#[from] hex::FromHexError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Pending,
    InProgress,
    Complete,
    Retry,
    Failed,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "retry" => Some(Self::Retry),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted ledger row. Immutable once written, apart from the `stream_*`
/// bookkeeping fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub ts: DateTime<Utc>,
    /// Hash of the previous row, or empty at genesis.
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
    pub signer_id: String,
    pub stream_status: StreamStatus,
    pub stream_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stream_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stream_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

/// Input to [`AuditStore::append`].
#[derive(Clone, Debug)]
pub struct AppendRequest {
    pub event_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
}

impl AppendRequest {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of an append.
#[derive(Clone, Debug)]
pub enum AppendOutcome {
    /// A new row was written.
    Appended(AuditEvent),
    /// The idempotent fast path matched the current tail; nothing written.
    Unchanged(AuditEvent),
    /// The audit policy sampled the event out; nothing written.
    Sampled,
}

impl AppendOutcome {
    pub fn event(&self) -> Option<&AuditEvent> {
        match self {
            Self::Appended(event) | Self::Unchanged(event) => Some(event),
            Self::Sampled => None,
        }
    }

    pub fn into_event(self) -> Option<AuditEvent> {
        match self {
            Self::Appended(event) | Self::Unchanged(event) => Some(event),
            Self::Sampled => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    Keep,
    Sample,
}

/// Pre-persistence hook; the default keeps every event.
pub trait AuditPolicy: Send + Sync {
    fn evaluate(&self, event_type: &str, payload: &Value) -> PolicyDecision;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct KeepAll;

impl AuditPolicy for KeepAll {
    fn evaluate(&self, _event_type: &str, _payload: &Value) -> PolicyDecision {
        PolicyDecision::Keep
    }
}

/// Outcome of one streaming delivery attempt, reported by the worker.
#[derive(Clone, Debug)]
pub enum StreamResult {
    Complete { archived_key: Option<String> },
    Failed { error: String },
}

/// `SHA256(canonical_payload ‖ hexdecode(prev_hash))`.
pub fn chain_digest(canonical_payload: &[u8], prev_hash: &str) -> Result<[u8; 32], ChainError> {
    let mut preimage = canonical_payload.to_vec();
    if !prev_hash.is_empty() {
        preimage.extend_from_slice(&hex::decode(prev_hash)?);
    }
    Ok(sha256(&preimage))
}

/// The authoritative ledger interface.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Run the append protocol: canonicalize, lock the tail, hash, sign,
    /// insert. Serialized per store; see the module docs.
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>, StoreError>;

    /// Newest row by `ts`, if any.
    async fn head(&self) -> Result<Option<AuditEvent>, StoreError>;

    /// Events ordered by `ts` ascending, strictly after `after` when given.
    async fn list_ordered(
        &self,
        after: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError>;

    /// Claim up to `limit` rows pending streaming, marking them
    /// `in_progress` and bumping `stream_attempts`.
    async fn claim_stream_batch(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError>;

    /// Record the delivery outcome for a claimed row.
    async fn mark_streamed(&self, id: Uuid, result: StreamResult) -> Result<(), StoreError>;

    /// Liveness probe used by `/ready`.
    async fn ping(&self) -> Result<(), StoreError>;
}

impl From<ChainError> for StoreError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Canonical(e) => StoreError::Canonical(e),
            ChainError::InvalidPrevHash(e) => StoreError::Encoding(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests;
