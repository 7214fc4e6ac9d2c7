//! Idempotency glue between warp and the sdk store.
//!
//! Wraps a mutation handler: claims the `Idempotency-Key`, replays or
//! conflicts on reuse, caches the successful response (up to the configured
//! body cap) and releases the claim when the handler fails so a clean retry
//! can run.

use {
    crate::reply::{error_reply, json_reply},
    kernel_sdk::{
        error::KernelError,
        idempotency::{request_fingerprint, CachedResponse, IdemDecision, IdempotencyStore},
    },
    serde_json::{json, Value},
    std::{future::Future, sync::Arc},
    warp::{http::StatusCode, reply::Response},
};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Releases an uncommitted claim if the request future is dropped (client
/// disconnect) before the handler completes.
struct ClaimGuard {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    armed: bool,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, key: String) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            if let Err(err) = store.release(&key).await {
                log::warn!("could not release abandoned idempotency key '{key}': {err}");
            }
        });
    }
}

pub struct IdempotencyLayer {
    store: Arc<dyn IdempotencyStore>,
    body_limit: usize,
    ttl: std::time::Duration,
}

impl IdempotencyLayer {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        body_limit: usize,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            store,
            body_limit,
            ttl,
        }
    }

    /// Run `handler` under the idempotency contract for `(key, method,
    /// path, body)` and produce the HTTP response.
    pub async fn run<F, Fut>(
        &self,
        key: Option<String>,
        method: &str,
        path: &str,
        body: &Value,
        handler: F,
    ) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(StatusCode, Value), KernelError>>,
    {
        let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
            return error_reply(&KernelError::invalid_input(
                "idempotency_key_required",
                "POST requests require an Idempotency-Key header",
            ));
        };

        let request_hash = match request_fingerprint(method, path, body) {
            Ok(hash) => hash,
            Err(err) => return error_reply(&err.into()),
        };

        match self
            .store
            .begin(&key, method, path, &request_hash, self.ttl)
            .await
        {
            Err(err) => error_reply(&err.into()),
            Ok(IdemDecision::Conflict) => error_reply(&KernelError::IdempotencyConflict),
            Ok(IdemDecision::Replay(cached)) => {
                let status = StatusCode::from_u16(cached.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                json_reply(status, &cached.body)
            }
            Ok(IdemDecision::Proceed) => {
                let mut guard = ClaimGuard::new(self.store.clone(), key.clone());
                match handler().await {
                    Ok((status, body)) => {
                        let cached = self.cacheable(status, &body);
                        if let Err(err) = self.store.complete(&key, cached).await {
                            log::warn!("could not cache idempotent response for '{key}': {err}");
                        }
                        guard.disarm();
                        json_reply(status, &body)
                    }
                    Err(err) => {
                        guard.disarm();
                        if let Err(release_err) = self.store.release(&key).await {
                            log::warn!("could not release idempotency key '{key}': {release_err}");
                        }
                        error_reply(&err)
                    }
                }
            }
        }
    }

    fn cacheable(&self, status: StatusCode, body: &Value) -> CachedResponse {
        let size = serde_json::to_vec(body).map(|b| b.len()).unwrap_or(0);
        if size <= self.body_limit {
            CachedResponse {
                status: status.as_u16(),
                body: body.clone(),
            }
        } else {
            // Oversized responses are not replayable; retries get a 413.
            CachedResponse {
                status: StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                body: json!({"error": "idempotency_response_too_large"}),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        kernel_sdk::idempotency::MemoryIdempotencyStore,
        std::time::Duration,
        warp::hyper::body::to_bytes,
    };

    fn layer(body_limit: usize) -> IdempotencyLayer {
        IdempotencyLayer::new(
            Arc::new(MemoryIdempotencyStore::new()),
            body_limit,
            Duration::from_secs(60),
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_key_is_a_400() {
        let layer = layer(1024);
        let response = layer
            .run(None, "POST", "/p", &json!({}), || async {
                Ok((StatusCode::OK, json!({})))
            })
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "idempotency_key_required"})
        );
    }

    #[tokio::test]
    async fn replay_returns_the_cached_body_without_rerunning() {
        let layer = layer(1024);
        let mut runs = 0;

        for _ in 0..2 {
            let response = layer
                .run(
                    Some("k1".into()),
                    "POST",
                    "/p",
                    &json!({"a": 1}),
                    || async {
                        runs += 1;
                        Ok((StatusCode::CREATED, json!({"id": "x"})))
                    },
                )
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
            assert_eq!(body_json(response).await, json!({"id": "x"}));
        }
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn reuse_with_a_different_body_is_a_412() {
        let layer = layer(1024);
        layer
            .run(Some("k2".into()), "POST", "/p", &json!({"a": 1}), || async {
                Ok((StatusCode::OK, json!({})))
            })
            .await;

        let response = layer
            .run(Some("k2".into()), "POST", "/p", &json!({"a": 2}), || async {
                Ok((StatusCode::OK, json!({})))
            })
            .await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            body_json(response).await,
            json!({"error": "idempotency_key_conflict"})
        );
    }

    #[tokio::test]
    async fn handler_failure_releases_the_claim_for_a_retry() {
        let layer = layer(1024);

        let response = layer
            .run(Some("k3".into()), "POST", "/p", &json!({}), || async {
                Err(KernelError::StoreUnavailable("db down".into()))
            })
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = layer
            .run(Some("k3".into()), "POST", "/p", &json!({}), || async {
                Ok((StatusCode::OK, json!({"recovered": true})))
            })
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"recovered": true}));
    }

    #[tokio::test]
    async fn oversized_responses_replay_as_413() {
        let layer = layer(16);
        let big = json!({"blob": "x".repeat(64)});

        // First caller still gets the real response.
        let response = layer
            .run(Some("k4".into()), "POST", "/p", &json!({}), || {
                let big = big.clone();
                async move { Ok((StatusCode::OK, big)) }
            })
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let replay = layer
            .run(Some("k4".into()), "POST", "/p", &json!({}), || async {
                panic!("must not rerun");
            })
            .await;
        assert_eq!(replay.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(replay).await,
            json!({"error": "idempotency_response_too_large"})
        );
    }
}
