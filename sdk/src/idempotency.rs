//! Idempotent request deduplication.
//!
//! Every POST carries a client-chosen `Idempotency-Key`. The first request
//! under a key claims it and runs; an identical retry replays the cached
//! response; a request reusing the key with a different fingerprint is a
//! conflict. A concurrent retry while the first holder is still executing
//! blocks until the holder commits, then replays.
//!
//! `request_hash = SHA256(method ‖ "|" ‖ path ‖ "|" ‖ canonical(body))`.

use {
    crate::{
        canonical::{canonical_bytes, sha256_hex, CanonicalError},
        error::StoreError,
    },
    async_trait::async_trait,
    chrono::{DateTime, Duration as ChronoDuration, Utc},
    serde_json::Value,
    sqlx::{PgPool, Row as _},
    std::{collections::HashMap, time::Duration},
    tokio::sync::{watch, Mutex},
};

/// How long a blocked duplicate waits for the in-flight holder to commit.
const IN_FLIGHT_WAIT: Duration = Duration::from_secs(30);
const IN_FLIGHT_POLL: Duration = Duration::from_millis(100);

/// Fingerprint binding a request body to its idempotency key.
pub fn request_fingerprint(
    method: &str,
    path: &str,
    body: &Value,
) -> Result<String, CanonicalError> {
    let canonical = canonical_bytes(body)?;
    let mut preimage =
        Vec::with_capacity(method.len() + path.len() + canonical.len() + 2);
    preimage.extend_from_slice(method.as_bytes());
    preimage.push(b'|');
    preimage.extend_from_slice(path.as_bytes());
    preimage.push(b'|');
    preimage.extend_from_slice(&canonical);
    Ok(sha256_hex(&preimage))
}

/// A response cached for replay.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Value,
}

/// Decision for an incoming `(key, request_hash)` pair.
#[derive(Clone, Debug)]
pub enum IdemDecision {
    /// First claim; run the handler and call `complete` (or `release`).
    Proceed,
    /// Identical retry; return the cached response as-is.
    Replay(CachedResponse),
    /// Same key, different request fingerprint.
    Conflict,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim `key` or resolve how an existing claim applies. Expired records
    /// are purged lazily here.
    async fn begin(
        &self,
        key: &str,
        method: &str,
        path: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdemDecision, StoreError>;

    /// Commit the handler's response for replay until the record expires.
    async fn complete(&self, key: &str, response: CachedResponse) -> Result<(), StoreError>;

    /// Abandon an uncommitted claim (handler error or client disconnect).
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

enum EntryState {
    InFlight(watch::Sender<bool>),
    Complete(CachedResponse),
}

struct Entry {
    request_hash: String,
    expires_at: DateTime<Utc>,
    state: EntryState,
}

/// In-memory store for tests and dev mode.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &str,
        _method: &str,
        _path: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdemDecision, StoreError> {
        let deadline = tokio::time::Instant::now() + IN_FLIGHT_WAIT;

        loop {
            let mut rx = {
                let mut entries = self.entries.lock().await;
                let now = Utc::now();
                entries.retain(|_, entry| entry.expires_at >= now);

                match entries.get(key) {
                    None => {
                        let (tx, _) = watch::channel(false);
                        entries.insert(
                            key.to_string(),
                            Entry {
                                request_hash: request_hash.to_string(),
                                expires_at: now
                                    + ChronoDuration::from_std(ttl).unwrap_or_else(|_| {
                                        ChronoDuration::try_seconds(86_400)
                                            .expect("constant in range")
                                    }),
                                state: EntryState::InFlight(tx),
                            },
                        );
                        return Ok(IdemDecision::Proceed);
                    }
                    Some(entry) if entry.request_hash != request_hash => {
                        return Ok(IdemDecision::Conflict);
                    }
                    Some(entry) => match &entry.state {
                        EntryState::Complete(resp) => {
                            return Ok(IdemDecision::Replay(resp.clone()));
                        }
                        EntryState::InFlight(tx) => tx.subscribe(),
                    },
                }
            };

            // The holder is still executing. Wait for it to commit or bail.
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Unavailable(
                    "idempotent request still in flight".into(),
                ));
            }
            let _ = tokio::time::timeout(IN_FLIGHT_POLL, rx.changed()).await;
        }
    }

    async fn complete(&self, key: &str, response: CachedResponse) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if let EntryState::InFlight(tx) = &entry.state {
                let _ = tx.send(true);
            }
            entry.state = EntryState::Complete(response);
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if matches!(
            entries.get(key).map(|e| &e.state),
            Some(EntryState::InFlight(_))
        ) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Postgres-backed store (`idempotency_keys` table).
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(
        &self,
        key: &str,
        method: &str,
        path: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<IdemDecision, StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;

        let deadline = tokio::time::Instant::now() + IN_FLIGHT_WAIT;
        let ttl_secs = ttl.as_secs() as i64;

        loop {
            let inserted = sqlx::query(
                "INSERT INTO idempotency_keys \
                     (key, method, path, request_hash, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4, now(), now() + make_interval(secs => $5)) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(method)
            .bind(path)
            .bind(request_hash)
            .bind(ttl_secs as f64)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(IdemDecision::Proceed);
            }

            let row = sqlx::query(
                "SELECT request_hash, response_status, response_body \
                   FROM idempotency_keys WHERE key = $1",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                // Raced with a purge or a release; claim again.
                continue;
            };

            let stored_hash: String = row.try_get("request_hash")?;
            if stored_hash != request_hash {
                return Ok(IdemDecision::Conflict);
            }

            let status: Option<i32> = row.try_get("response_status")?;
            if let Some(status) = status {
                let body: Value = row.try_get("response_body")?;
                return Ok(IdemDecision::Replay(CachedResponse {
                    status: status as u16,
                    body,
                }));
            }

            // In flight on another worker; wait for its commit.
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Unavailable(
                    "idempotent request still in flight".into(),
                ));
            }
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
    }

    async fn complete(&self, key: &str, response: CachedResponse) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE idempotency_keys SET response_status = $2, response_body = $3 WHERE key = $1",
        )
        .bind(key)
        .bind(response.status as i32)
        .bind(&response.body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND response_status IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json, std::sync::Arc};

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn fingerprint_binds_method_path_and_body() {
        let body = json!({"manifest": {"id": "m1"}});
        let base = request_fingerprint("POST", "/kernel/sign", &body).unwrap();

        assert_eq!(
            base,
            request_fingerprint("POST", "/kernel/sign", &body).unwrap()
        );
        assert_ne!(
            base,
            request_fingerprint("PUT", "/kernel/sign", &body).unwrap()
        );
        assert_ne!(
            base,
            request_fingerprint("POST", "/kernel/audit", &body).unwrap()
        );
        assert_ne!(
            base,
            request_fingerprint("POST", "/kernel/sign", &json!({"manifest": {"id": "m2"}}))
                .unwrap()
        );

        // Key order inside the body must not matter.
        let reordered: Value =
            serde_json::from_str(r#"{"manifest":{"id":"m1"}}"#).unwrap();
        assert_eq!(
            base,
            request_fingerprint("POST", "/kernel/sign", &reordered).unwrap()
        );
    }

    #[tokio::test]
    async fn replay_after_complete() {
        let store = MemoryIdempotencyStore::new();
        let hash = "aa".repeat(32);

        assert!(matches!(
            store.begin("k1", "POST", "/p", &hash, TTL).await.unwrap(),
            IdemDecision::Proceed
        ));
        store
            .complete(
                "k1",
                CachedResponse {
                    status: 201,
                    body: json!({"id": "x"}),
                },
            )
            .await
            .unwrap();

        match store.begin("k1", "POST", "/p", &hash, TTL).await.unwrap() {
            IdemDecision::Replay(resp) => {
                assert_eq!(resp.status, 201);
                assert_eq!(resp.body, json!({"id": "x"}));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_on_different_fingerprint() {
        let store = MemoryIdempotencyStore::new();
        store
            .begin("k2", "POST", "/p", &"aa".repeat(32), TTL)
            .await
            .unwrap();

        assert!(matches!(
            store
                .begin("k2", "POST", "/p", &"bb".repeat(32), TTL)
                .await
                .unwrap(),
            IdemDecision::Conflict
        ));
    }

    #[tokio::test]
    async fn concurrent_same_key_blocks_then_replays() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let hash = "cc".repeat(32);

        assert!(matches!(
            store.begin("k3", "POST", "/p", &hash, TTL).await.unwrap(),
            IdemDecision::Proceed
        ));

        let waiter = {
            let store = store.clone();
            let hash = hash.clone();
            tokio::spawn(async move { store.begin("k3", "POST", "/p", &hash, TTL).await })
        };

        // Give the duplicate time to block, then commit the first claim.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .complete(
                "k3",
                CachedResponse {
                    status: 202,
                    body: json!({"id": "audit-1"}),
                },
            )
            .await
            .unwrap();

        match waiter.await.unwrap().unwrap() {
            IdemDecision::Replay(resp) => assert_eq!(resp.status, 202),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_frees_the_key_for_a_fresh_claim() {
        let store = MemoryIdempotencyStore::new();
        let hash = "dd".repeat(32);

        store.begin("k4", "POST", "/p", &hash, TTL).await.unwrap();
        store.release("k4").await.unwrap();

        assert!(matches!(
            store.begin("k4", "POST", "/p", &hash, TTL).await.unwrap(),
            IdemDecision::Proceed
        ));
    }

    #[tokio::test]
    async fn release_never_drops_a_committed_response() {
        let store = MemoryIdempotencyStore::new();
        let hash = "ee".repeat(32);

        store.begin("k5", "POST", "/p", &hash, TTL).await.unwrap();
        store
            .complete(
                "k5",
                CachedResponse {
                    status: 200,
                    body: json!({}),
                },
            )
            .await
            .unwrap();
        store.release("k5").await.unwrap();

        assert!(matches!(
            store.begin("k5", "POST", "/p", &hash, TTL).await.unwrap(),
            IdemDecision::Replay(_)
        ));
    }

    #[tokio::test]
    async fn expired_records_are_purged_lazily() {
        let store = MemoryIdempotencyStore::new();
        let hash = "ff".repeat(32);
        let ttl = Duration::from_millis(10);

        store.begin("k6", "POST", "/p", &hash, ttl).await.unwrap();
        store
            .complete(
                "k6",
                CachedResponse {
                    status: 200,
                    body: json!({}),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            store.begin("k6", "POST", "/p", &hash, ttl).await.unwrap(),
            IdemDecision::Proceed
        ));
    }
}
