//! Background streaming of persisted audit events to an external archive.
//!
//! Workers claim disjoint batches through the store (`SKIP LOCKED` on
//! Postgres), publish each row to the archive, and record the outcome. The
//! store enforces the retry budget; delivery is at-least-once and consumers
//! dedupe by event id.

use {
    async_trait::async_trait,
    kernel_sdk::{
        audit::{AuditEvent, AuditStore, StreamResult},
        config::ArchiveConfig,
    },
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    tokio::task::JoinHandle,
};

/// Monotonic delivery counters, surfaced through `/ready`.
#[derive(Debug, Default)]
pub struct StreamStats {
    published: AtomicU64,
    failed: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Destination for streamed events. Returns the archive key on success.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn publish(&self, event: &AuditEvent) -> anyhow::Result<String>;
}

/// HTTP object-store sink: `PUT {base}/{key}` with the event as JSON.
pub struct HttpArchive {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpArchive {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn object_key(event: &AuditEvent) -> String {
        format!("audit/{}/{}.json", event.ts.format("%Y/%m/%d"), event.id)
    }
}

#[async_trait]
impl ArchiveSink for HttpArchive {
    async fn publish(&self, event: &AuditEvent) -> anyhow::Result<String> {
        let key = Self::object_key(event);
        let mut request = self
            .client
            .put(format!("{}/{}", self.base_url, key))
            .json(event);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("archive returned status {status}");
        }
        Ok(key)
    }
}

pub struct StreamWorker {
    store: Arc<dyn AuditStore>,
    sink: Arc<dyn ArchiveSink>,
    stats: Arc<StreamStats>,
    batch_size: i64,
    interval: std::time::Duration,
}

impl StreamWorker {
    pub fn new(
        store: Arc<dyn AuditStore>,
        sink: Arc<dyn ArchiveSink>,
        stats: Arc<StreamStats>,
        batch_size: i64,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            sink,
            stats,
            batch_size,
            interval,
        }
    }

    /// Claim one batch and deliver it. Returns the number of claimed rows.
    pub async fn run_once(&self) -> usize {
        let claimed = match self.store.claim_stream_batch(self.batch_size).await {
            Ok(claimed) => claimed,
            Err(err) => {
                log::warn!("could not claim stream batch: {err}");
                return 0;
            }
        };
        let count = claimed.len();

        for event in claimed {
            let outcome = match self.sink.publish(&event).await {
                Ok(key) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    StreamResult::Complete {
                        archived_key: Some(key),
                    }
                }
                Err(err) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("streaming event {} failed: {err}", event.id);
                    StreamResult::Failed {
                        error: err.to_string(),
                    }
                }
            };
            if let Err(err) = self.store.mark_streamed(event.id, outcome).await {
                log::warn!("could not record stream outcome for {}: {err}", event.id);
            }
        }
        count
    }

    /// Run forever on the configured interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Drain eagerly while full batches keep coming.
                while self.run_once().await as i64 >= self.batch_size {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        kernel_sdk::{
            audit::{AppendRequest, MemoryAuditStore, StreamStatus, MAX_STREAM_ATTEMPTS},
            signer::LocalEd25519Signer,
        },
        serde_json::json,
        std::time::Duration,
    };

    async fn store_with_events(n: usize) -> Arc<MemoryAuditStore> {
        let signer = Arc::new(LocalEd25519Signer::generate());
        let store = Arc::new(MemoryAuditStore::new(signer));
        for i in 0..n {
            store
                .append(AppendRequest::new("test.stream", json!({"seq": i})))
                .await
                .unwrap();
        }
        store
    }

    fn worker(
        store: Arc<MemoryAuditStore>,
        sink: Arc<dyn ArchiveSink>,
        stats: Arc<StreamStats>,
    ) -> StreamWorker {
        StreamWorker::new(store, sink, stats, 10, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn publishes_claimed_rows_and_records_the_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", mockito::Matcher::Regex(r"^/audit/.+\.json$".into()))
            .with_status(200)
            .expect(3)
            .create_async()
            .await;

        let store = store_with_events(3).await;
        let stats = Arc::new(StreamStats::new());
        let sink = Arc::new(HttpArchive::new(&ArchiveConfig {
            url: server.url(),
            api_key: None,
        }));

        let processed = worker(store.clone(), sink, stats.clone()).run_once().await;
        assert_eq!(processed, 3);
        assert_eq!(stats.snapshot(), (3, 0));
        mock.assert_async().await;

        let events = store.list_ordered(None, 10).await.unwrap();
        for event in events {
            assert_eq!(event.stream_status, StreamStatus::Complete);
            assert_eq!(
                event.archived_key.as_deref(),
                Some(format!("audit/{}/{}.json", event.ts.format("%Y/%m/%d"), event.id).as_str())
            );
        }
    }

    #[tokio::test]
    async fn failures_are_retried_until_the_budget_parks_the_row() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", mockito::Matcher::Regex(r"^/audit/.+\.json$".into()))
            .with_status(503)
            .expect(MAX_STREAM_ATTEMPTS as usize)
            .create_async()
            .await;

        let store = store_with_events(1).await;
        let stats = Arc::new(StreamStats::new());
        let sink = Arc::new(HttpArchive::new(&ArchiveConfig {
            url: server.url(),
            api_key: None,
        }));
        let worker = worker(store.clone(), sink, stats.clone());

        for _ in 0..MAX_STREAM_ATTEMPTS {
            assert_eq!(worker.run_once().await, 1);
        }
        // The row is parked as failed; nothing further is claimed.
        assert_eq!(worker.run_once().await, 0);
        assert_eq!(stats.snapshot(), (0, MAX_STREAM_ATTEMPTS as u64));

        let events = store.list_ordered(None, 10).await.unwrap();
        assert_eq!(events[0].stream_status, StreamStatus::Failed);
        assert!(events[0]
            .last_stream_error
            .as_deref()
            .unwrap()
            .contains("503"));
    }

    #[tokio::test]
    async fn a_retry_after_recovery_completes() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("PUT", mockito::Matcher::Regex(r"^/audit/.+\.json$".into()))
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let store = store_with_events(1).await;
        let stats = Arc::new(StreamStats::new());
        let sink = Arc::new(HttpArchive::new(&ArchiveConfig {
            url: server.url(),
            api_key: None,
        }));
        let worker = worker(store.clone(), sink, stats.clone());

        assert_eq!(worker.run_once().await, 1);
        failing.assert_async().await;

        // Archive recovers; the retry claim succeeds.
        server
            .mock("PUT", mockito::Matcher::Regex(r"^/audit/.+\.json$".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        assert_eq!(worker.run_once().await, 1);
        assert_eq!(stats.snapshot(), (1, 1));

        let events = store.list_ordered(None, 10).await.unwrap();
        assert_eq!(events[0].stream_status, StreamStatus::Complete);
    }
}
