use chrono::{Duration, Utc};

use crate::model::{ChangesetRecord, ChangesetState, FeedType, PointerPosition};
use crate::storage::{
    ChangesetStore, ClaimRequest, ContextStore, ProcessedUpdate, StorageError, TimestampColumn,
};

use super::*;

fn aged(cid: i64, state: ChangesetState, age_secs: i64) -> ChangesetRecord {
    let ts = Utc::now() - Duration::seconds(age_secs);
    let mut record = ChangesetRecord::observed(cid, None, ts);
    record.state = state;
    record
}

#[tokio::test]
async fn test_mock_claim_oldest_queued_first() {
    let store = MockChangesetStore::new();
    store.insert(aged(1, ChangesetState::New, 10)).await;
    store.insert(aged(2, ChangesetState::New, 100)).await;

    let request = ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck);
    let first = store.claim(&request).await.unwrap().unwrap();
    assert_eq!(first.cid, 2);
    assert_eq!(first.state, ChangesetState::BoundsCheck);

    let second = store.claim(&request).await.unwrap().unwrap();
    assert_eq!(second.cid, 1);
    assert!(store.claim(&request).await.unwrap().is_none());
}

#[tokio::test]
async fn test_mock_claim_failure_injection() {
    let store = MockChangesetStore::new();
    store.append(1, None).await.unwrap();
    store.set_fail_on_claim(true).await;

    let request = ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck);
    assert!(store.claim(&request).await.is_err());

    store.set_fail_on_claim(false).await;
    assert!(store.claim(&request).await.unwrap().is_some());
}

#[tokio::test]
async fn test_mock_claim_respects_staleness() {
    let store = MockChangesetStore::new();
    store.insert(aged(1, ChangesetState::Open, 30)).await;

    let cutoff = Utc::now() - Duration::seconds(300);
    let request = ClaimRequest::new(ChangesetState::Open, ChangesetState::Analyzing1)
        .stale(TimestampColumn::Refreshed, cutoff);
    assert!(store.claim(&request).await.unwrap().is_none());

    store.insert(aged(2, ChangesetState::Open, 600)).await;
    assert_eq!(store.claim(&request).await.unwrap().unwrap().cid, 2);
}

#[tokio::test]
async fn test_mock_processed_unknown_cid() {
    let store = MockChangesetStore::new();
    let result = store
        .processed(99, &ProcessedUpdate::state(ChangesetState::Done))
        .await;
    assert!(matches!(result, Err(StorageError::NotFound(99))));
}

#[tokio::test]
async fn test_mock_context_pointer_requires_set() {
    let store = MockContextStore::new();
    assert!(store.pointer().await.unwrap().is_none());
    assert!(matches!(
        store.pointer_advance(1).await,
        Err(StorageError::NoPointer)
    ));

    store
        .set_pointer(&PointerPosition {
            stype: FeedType::Minute,
            seqno: 5,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(store.pointer_advance(1).await.unwrap().seqno, 6);
}
