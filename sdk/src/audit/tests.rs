use {
    super::*,
    crate::{
        canonical::{canonical_bytes, sha256},
        signer::{LocalEd25519Signer, Signer},
    },
    serde_json::json,
    std::sync::Arc,
};

fn new_store() -> (Arc<LocalEd25519Signer>, Arc<MemoryAuditStore>) {
    let signer = Arc::new(LocalEd25519Signer::generate());
    let store = Arc::new(MemoryAuditStore::new(signer.clone()));
    (signer, store)
}

#[test]
fn chain_digest_matches_manual_concatenation() {
    let canonical = canonical_bytes(&json!({"n": 1})).unwrap();

    // Genesis: no previous hash bytes.
    assert_eq!(chain_digest(&canonical, "").unwrap(), sha256(&canonical));

    let prev = sha256(b"previous");
    let prev_hex = hex::encode(prev);
    let mut preimage = canonical.clone();
    preimage.extend_from_slice(&prev);
    assert_eq!(chain_digest(&canonical, &prev_hex).unwrap(), sha256(&preimage));
}

#[test]
fn chain_digest_rejects_bad_hex() {
    assert!(matches!(
        chain_digest(b"{}", "zz"),
        Err(ChainError::InvalidPrevHash(_))
    ));
}

#[tokio::test]
async fn genesis_append_then_chain() {
    let (signer, store) = new_store();

    let first = store
        .append(AppendRequest::new("test.a", json!({"n": 1})))
        .await
        .unwrap();
    let first = match first {
        AppendOutcome::Appended(e) => e,
        other => panic!("expected append, got {other:?}"),
    };

    assert_eq!(first.prev_hash, "");
    let canonical = canonical_bytes(&json!({"n": 1})).unwrap();
    assert_eq!(first.hash, hex::encode(sha256(&canonical)));
    assert_eq!(first.stream_status, StreamStatus::Pending);

    // The signature covers the raw digest bytes.
    let digest = hex::decode(&first.hash).unwrap();
    assert!(signer
        .verify(&digest, &first.signature, &first.signer_id)
        .await
        .unwrap());

    let second = store
        .append(AppendRequest::new("test.a", json!({"n": 2})))
        .await
        .unwrap()
        .into_event()
        .unwrap();

    assert_eq!(second.prev_hash, first.hash);
    let canonical2 = canonical_bytes(&json!({"n": 2})).unwrap();
    let expected = chain_digest(&canonical2, &first.hash).unwrap();
    assert_eq!(second.hash, hex::encode(expected));
}

#[tokio::test]
async fn identical_rerun_hits_the_fast_path() {
    let (_, store) = new_store();

    let first = store
        .append(AppendRequest::new("division.created", json!({"id": "d1"})))
        .await
        .unwrap()
        .into_event()
        .unwrap();

    let replay = store
        .append(AppendRequest::new("division.created", json!({"id": "d1"})))
        .await
        .unwrap();

    match replay {
        AppendOutcome::Unchanged(event) => assert_eq!(event.id, first.id),
        other => panic!("expected unchanged, got {other:?}"),
    }
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn fast_path_requires_an_unchanged_tail() {
    let (_, store) = new_store();

    store
        .append(AppendRequest::new("test.a", json!({"n": 1})))
        .await
        .unwrap();
    store
        .append(AppendRequest::new("test.b", json!({"n": 2})))
        .await
        .unwrap();

    // Same payload as the first append, but the tail moved on.
    let third = store
        .append(AppendRequest::new("test.a", json!({"n": 1})))
        .await
        .unwrap();
    assert!(matches!(third, AppendOutcome::Appended(_)));
    assert_eq!(store.len().await, 3);
}

struct SampleNoise;

impl AuditPolicy for SampleNoise {
    fn evaluate(&self, event_type: &str, _payload: &serde_json::Value) -> PolicyDecision {
        if event_type.starts_with("debug.") {
            PolicyDecision::Sample
        } else {
            PolicyDecision::Keep
        }
    }
}

#[tokio::test]
async fn sampled_events_are_not_persisted() {
    let signer = Arc::new(LocalEd25519Signer::generate());
    let store = MemoryAuditStore::with_policy(signer, Arc::new(SampleNoise));

    let outcome = store
        .append(AppendRequest::new("debug.noise", json!({"x": 1})))
        .await
        .unwrap();
    assert!(matches!(outcome, AppendOutcome::Sampled));
    assert!(store.is_empty().await);

    let kept = store
        .append(AppendRequest::new("test.signal", json!({"x": 1})))
        .await
        .unwrap();
    assert!(matches!(kept, AppendOutcome::Appended(_)));
}

#[tokio::test]
async fn concurrent_appends_keep_the_chain_linear() {
    let (_, store) = new_store();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append(AppendRequest::new("test.concurrent", json!({"n": n})))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = store.list_ordered(None, 100).await.unwrap();
    assert_eq!(events.len(), 8);

    let mut prev_hash = String::new();
    for event in &events {
        assert_eq!(event.prev_hash, prev_hash);
        let canonical = canonical_bytes(&event.payload).unwrap();
        let digest = chain_digest(&canonical, &event.prev_hash).unwrap();
        assert_eq!(event.hash, hex::encode(digest));
        prev_hash = event.hash.clone();
    }
}

#[tokio::test]
async fn stream_claims_respect_the_retry_budget() {
    let (_, store) = new_store();

    let event = store
        .append(AppendRequest::new("test.stream", json!({"n": 1})))
        .await
        .unwrap()
        .into_event()
        .unwrap();

    for attempt in 1..=MAX_STREAM_ATTEMPTS {
        let claimed = store.claim_stream_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {attempt}");
        assert_eq!(claimed[0].stream_attempts, attempt);
        assert_eq!(claimed[0].stream_status, StreamStatus::InProgress);

        store
            .mark_streamed(
                event.id,
                StreamResult::Failed {
                    error: "archive unreachable".into(),
                },
            )
            .await
            .unwrap();
    }

    // Budget exhausted: parked as failed, never claimed again.
    let parked = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(parked.stream_status, StreamStatus::Failed);
    assert!(store.claim_stream_batch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn stream_completion_records_the_archive_key() {
    let (_, store) = new_store();

    let event = store
        .append(AppendRequest::new("test.stream", json!({"n": 1})))
        .await
        .unwrap()
        .into_event()
        .unwrap();

    store.claim_stream_batch(10).await.unwrap();
    store
        .mark_streamed(
            event.id,
            StreamResult::Complete {
                archived_key: Some(format!("audit/{}.json", event.id)),
            },
        )
        .await
        .unwrap();

    let archived = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(archived.stream_status, StreamStatus::Complete);
    assert_eq!(
        archived.archived_key.as_deref(),
        Some(format!("audit/{}.json", event.id).as_str())
    );
    assert!(archived.archived_at.is_some());
}
