//! ChangesetStore interface tests.
//!
//! These tests verify the contract of the ChangesetStore trait.
//! Each storage implementation should run these tests. Every test removes
//! the records it created, so they can share one store.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use osmtracker::model::{ChangesetInfo, ChangesetMeta, ChangesetState, Comment, FeedType, Source};
use osmtracker::storage::{
    ChangesetQuery, ChangesetStore, ClaimRequest, ProcessedUpdate, StorageError, TimestampColumn,
};

/// Create a source as recorded by the minute feed.
pub fn make_source(sequenceno: u64) -> Source {
    Source {
        feed: FeedType::Minute,
        sequenceno,
        observed: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        bbox: None,
    }
}

/// Create closed changeset metadata.
pub fn make_meta(cid: i64, closed_at: DateTime<Utc>) -> ChangesetMeta {
    let mut tag = BTreeMap::new();
    tag.insert("comment".to_string(), format!("Changeset {}", cid));
    ChangesetMeta {
        id: cid,
        user: Some("mapper".to_string()),
        uid: 42,
        open: false,
        created_at: closed_at - chrono::Duration::minutes(10),
        closed_at: Some(closed_at),
        min_lat: Some(55.6),
        min_lon: Some(12.5),
        max_lat: Some(55.7),
        max_lon: Some(12.6),
        comments_count: 0,
        changes_count: 3,
        tag,
        discussion: Vec::new(),
    }
}

async fn cleanup<S: ChangesetStore>(store: &S, cids: &[i64]) {
    for cid in cids {
        store.remove(*cid).await.expect("remove should succeed");
    }
}

fn new_to_check() -> ClaimRequest {
    ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck)
}

// =============================================================================
// append / get
// =============================================================================

pub async fn test_append_creates_new_record<S: ChangesetStore>(store: &S) {
    store
        .append(101, Some(make_source(7)))
        .await
        .expect("append should succeed");

    let record = store.get(101).await.unwrap().expect("record should exist");
    assert_eq!(record.cid, 101);
    assert_eq!(record.state, ChangesetState::New);
    assert!(record.labels.is_empty());
    assert_eq!(record.queued, record.updated);
    assert_eq!(record.queued, record.refreshed);
    assert_eq!(record.queued, record.state_changed);
    assert_eq!(record.source, Some(make_source(7)));
    assert!(record.meta.is_none());
    assert!(record.info.is_none());

    cleanup(store, &[101]).await;
}

pub async fn test_append_replaces_existing<S: ChangesetStore>(store: &S) {
    let closed = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
    store.append(102, None).await.unwrap();
    store.set_meta(102, &make_meta(102, closed)).await.unwrap();
    store
        .processed(
            102,
            &ProcessedUpdate::state(ChangesetState::BoundsChecked)
                .with_labels(vec!["adjustments".to_string()]),
        )
        .await
        .unwrap();

    store.append(102, Some(make_source(8))).await.unwrap();
    let record = store.get(102).await.unwrap().unwrap();
    assert_eq!(record.state, ChangesetState::New);
    assert!(record.labels.is_empty());
    assert!(record.meta.is_none());
    assert_eq!(record.source, Some(make_source(8)));

    cleanup(store, &[102]).await;
}

pub async fn test_get_missing<S: ChangesetStore>(store: &S) {
    assert!(store.get(999_999).await.unwrap().is_none());
}

// =============================================================================
// claim
// =============================================================================

pub async fn test_claim_oldest_first<S: ChangesetStore>(store: &S) {
    store.append(201, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    store.append(202, None).await.unwrap();

    let first = store.claim(&new_to_check()).await.unwrap().unwrap();
    assert_eq!(first.cid, 201);
    assert_eq!(first.state, ChangesetState::BoundsCheck);
    assert_eq!(
        store.get(201).await.unwrap().unwrap().state,
        ChangesetState::BoundsCheck
    );

    let second = store.claim(&new_to_check()).await.unwrap().unwrap();
    assert_eq!(second.cid, 202);
    assert!(store.claim(&new_to_check()).await.unwrap().is_none());

    cleanup(store, &[201, 202]).await;
}

pub async fn test_claim_respects_staleness<S: ChangesetStore>(store: &S) {
    store.append(301, None).await.unwrap();
    store
        .processed(301, &ProcessedUpdate::state(ChangesetState::Open).refreshed())
        .await
        .unwrap();

    let fresh = ClaimRequest::new(ChangesetState::Open, ChangesetState::Analyzing1)
        .stale(TimestampColumn::Refreshed, Utc::now() - chrono::Duration::hours(1));
    assert!(store.claim(&fresh).await.unwrap().is_none());

    let stale = ClaimRequest::new(ChangesetState::Open, ChangesetState::Analyzing1)
        .stale(TimestampColumn::Refreshed, Utc::now() + chrono::Duration::seconds(1));
    let claimed = store.claim(&stale).await.unwrap().unwrap();
    assert_eq!(claimed.cid, 301);
    assert_eq!(claimed.state, ChangesetState::Analyzing1);

    cleanup(store, &[301]).await;
}

pub async fn test_claim_single_winner<S: ChangesetStore>(store: &S) {
    store.append(401, None).await.unwrap();

    let request = new_to_check();
    let (a, b) = tokio::join!(store.claim(&request), store.claim(&request));
    let winners = [a.unwrap(), b.unwrap()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(winners.len(), 1, "exactly one claim should win");
    assert_eq!(winners[0].cid, 401);

    cleanup(store, &[401]).await;
}

// =============================================================================
// set_meta / set_info
// =============================================================================

pub async fn test_set_meta_gated<S: ChangesetStore>(store: &S) {
    let closed = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
    let meta = make_meta(501, closed);
    store.append(501, None).await.unwrap();

    assert!(store.set_meta(501, &meta).await.unwrap());
    assert!(!store.set_meta(501, &meta).await.unwrap());

    let mut changed = meta.clone();
    changed.comments_count = 1;
    assert!(store.set_meta(501, &changed).await.unwrap());
    assert_eq!(store.get(501).await.unwrap().unwrap().meta, Some(changed));

    cleanup(store, &[501]).await;
}

pub async fn test_set_info_gated<S: ChangesetStore>(store: &S) {
    let mut info = ChangesetInfo::default();
    info.misc.state = Some("new".to_string());
    store.append(502, None).await.unwrap();

    assert!(store.set_info(502, &info).await.unwrap());
    assert!(!store.set_info(502, &info).await.unwrap());

    info.misc.state = Some("old".to_string());
    assert!(store.set_info(502, &info).await.unwrap());
    assert_eq!(store.get(502).await.unwrap().unwrap().info, Some(info));

    cleanup(store, &[502]).await;
}

pub async fn test_set_meta_missing<S: ChangesetStore>(store: &S) {
    let meta = make_meta(503, Utc::now());
    let result = store.set_meta(503, &meta).await;
    assert!(matches!(result, Err(StorageError::NotFound(503))));
}

// =============================================================================
// processed / restore / remove
// =============================================================================

pub async fn test_processed_updates_record<S: ChangesetStore>(store: &S) {
    let closed = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    store.append(601, None).await.unwrap();
    store.set_meta(601, &make_meta(601, closed)).await.unwrap();

    store
        .processed(
            601,
            &ProcessedUpdate::state(ChangesetState::Done)
                .refreshed()
                .with_labels(vec!["a".to_string(), "b".to_string()]),
        )
        .await
        .unwrap();

    let record = store.get(601).await.unwrap().unwrap();
    assert_eq!(record.state, ChangesetState::Done);
    assert_eq!(record.labels, vec!["a", "b"]);
    assert_eq!(record.updated, closed);
    assert!(record.refreshed >= record.queued);

    cleanup(store, &[601]).await;
}

pub async fn test_processed_uses_discussion_timestamp<S: ChangesetStore>(store: &S) {
    let closed = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let commented = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
    let mut meta = make_meta(602, closed);
    meta.comments_count = 1;
    meta.discussion.push(Comment {
        date: commented,
        uid: 7,
        user: Some("reviewer".to_string()),
        text: "Thanks".to_string(),
    });
    store.append(602, None).await.unwrap();
    store.set_meta(602, &meta).await.unwrap();

    store
        .processed(602, &ProcessedUpdate::state(ChangesetState::Done))
        .await
        .unwrap();
    assert_eq!(store.get(602).await.unwrap().unwrap().updated, commented);

    cleanup(store, &[602]).await;
}

pub async fn test_restore_keeps_content<S: ChangesetStore>(store: &S) {
    let closed = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
    let meta = make_meta(701, closed);
    store.append(701, None).await.unwrap();
    store.set_meta(701, &meta).await.unwrap();
    store.claim(&new_to_check()).await.unwrap().unwrap();

    store.restore(701, ChangesetState::New).await.unwrap();
    let record = store.get(701).await.unwrap().unwrap();
    assert_eq!(record.state, ChangesetState::New);
    assert_eq!(record.meta, Some(meta));

    assert!(store.restore(799_999, ChangesetState::New).await.is_err());

    cleanup(store, &[701]).await;
}

pub async fn test_fail_counts_until_processed<S: ChangesetStore>(store: &S) {
    store.append(703, None).await.unwrap();

    for expected in 1..=2 {
        let claimed = store.claim(&new_to_check()).await.unwrap().unwrap();
        assert_eq!(claimed.cid, 703);
        assert_eq!(store.fail(703, ChangesetState::New).await.unwrap(), expected);
        let record = store.get(703).await.unwrap().unwrap();
        assert_eq!(record.state, ChangesetState::New);
        assert_eq!(record.failures, expected);
    }

    store
        .processed(703, &ProcessedUpdate::state(ChangesetState::BoundsChecked))
        .await
        .unwrap();
    assert_eq!(store.get(703).await.unwrap().unwrap().failures, 0);

    store.fail(703, ChangesetState::BoundsChecked).await.unwrap();
    store
        .processed(703, &ProcessedUpdate::state(ChangesetState::Quarantined))
        .await
        .unwrap();
    let record = store.get(703).await.unwrap().unwrap();
    assert_eq!(record.state, ChangesetState::Quarantined);
    assert_eq!(record.failures, 1, "quarantine keeps the failure count");

    assert!(store.fail(799_999, ChangesetState::New).await.is_err());

    cleanup(store, &[703]).await;
}

pub async fn test_claim_skips_listed_cids<S: ChangesetStore>(store: &S) {
    store.append(705, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    store.append(706, None).await.unwrap();

    let request = new_to_check().skipping([705]);
    let claimed = store.claim(&request).await.unwrap().unwrap();
    assert_eq!(claimed.cid, 706, "skipped record should be passed over");
    assert!(store.claim(&request).await.unwrap().is_none());
    assert_eq!(
        store.get(705).await.unwrap().unwrap().state,
        ChangesetState::New
    );

    cleanup(store, &[705, 706]).await;
}

pub async fn test_remove<S: ChangesetStore>(store: &S) {
    store.append(702, None).await.unwrap();
    assert!(store.remove(702).await.unwrap());
    assert!(store.get(702).await.unwrap().is_none());
    assert!(!store.remove(702).await.unwrap());
}

// =============================================================================
// find / count_by_state
// =============================================================================

pub async fn test_find_newest_first<S: ChangesetStore>(store: &S) {
    for cid in [801, 802, 803] {
        store.append(cid, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    store
        .processed(803, &ProcessedUpdate::state(ChangesetState::Open))
        .await
        .unwrap();

    let found = store
        .find(&ChangesetQuery::in_states(&[ChangesetState::New]))
        .await
        .unwrap();
    let cids: Vec<i64> = found.iter().map(|r| r.cid).collect();
    assert_eq!(cids, vec![802, 801]);

    let limited = store
        .find(&ChangesetQuery {
            limit: Some(1),
            ..ChangesetQuery::in_states(&[ChangesetState::New, ChangesetState::Open])
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].cid, 803);

    let all = store.find(&ChangesetQuery::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    cleanup(store, &[801, 802, 803]).await;
}

pub async fn test_count_by_state<S: ChangesetStore>(store: &S) {
    for cid in [811, 812, 813] {
        store.append(cid, None).await.unwrap();
    }
    store
        .processed(813, &ProcessedUpdate::state(ChangesetState::Done))
        .await
        .unwrap();

    let counts = store.count_by_state().await.unwrap();
    assert_eq!(counts.get(&ChangesetState::New), Some(&2));
    assert_eq!(counts.get(&ChangesetState::Done), Some(&1));
    assert_eq!(counts.get(&ChangesetState::Open), None);

    cleanup(store, &[811, 812, 813]).await;
}

// =============================================================================
// sweeps
// =============================================================================

pub async fn test_reclaim_stale<S: ChangesetStore>(store: &S) {
    store.append(901, None).await.unwrap();
    store.claim(&new_to_check()).await.unwrap().unwrap();
    store.append(902, None).await.unwrap();

    let past = Utc::now() - chrono::Duration::hours(1);
    assert_eq!(store.reclaim_stale(past).await.unwrap(), 0);

    let future = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(store.reclaim_stale(future).await.unwrap(), 1);
    assert_eq!(
        store.get(901).await.unwrap().unwrap().state,
        ChangesetState::New
    );
    assert_eq!(
        store.get(902).await.unwrap().unwrap().state,
        ChangesetState::New
    );

    cleanup(store, &[901, 902]).await;
}

pub async fn test_reset_states<S: ChangesetStore>(store: &S) {
    for cid in [1001, 1002] {
        store.append(cid, None).await.unwrap();
        store
            .processed(cid, &ProcessedUpdate::state(ChangesetState::Done))
            .await
            .unwrap();
    }

    let one = store
        .reset_states(&[ChangesetState::Done], ChangesetState::Closed, Some(1001))
        .await
        .unwrap();
    assert_eq!(one, 1);
    assert_eq!(
        store.get(1001).await.unwrap().unwrap().state,
        ChangesetState::Closed
    );
    assert_eq!(
        store.get(1002).await.unwrap().unwrap().state,
        ChangesetState::Done
    );

    let rest = store
        .reset_states(&[ChangesetState::Done], ChangesetState::Closed, None)
        .await
        .unwrap();
    assert_eq!(rest, 1);

    cleanup(store, &[1001, 1002]).await;
}

pub async fn test_evict_older_than<S: ChangesetStore>(store: &S) {
    let long_ago = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    store.append(1101, None).await.unwrap();
    store.set_meta(1101, &make_meta(1101, long_ago)).await.unwrap();
    store
        .processed(1101, &ProcessedUpdate::state(ChangesetState::Done))
        .await
        .unwrap();
    store.append(1102, None).await.unwrap();

    let evicted = store
        .evict_older_than(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(evicted, 1);
    assert!(store.get(1101).await.unwrap().is_none());
    assert!(store.get(1102).await.unwrap().is_some());

    cleanup(store, &[1102]).await;
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all ChangesetStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_changeset_store_tests {
    ($store:expr) => {
        use $crate::storage::changeset_store_tests::*;

        // append / get
        test_append_creates_new_record($store).await;
        println!("  test_append_creates_new_record: PASSED");

        test_append_replaces_existing($store).await;
        println!("  test_append_replaces_existing: PASSED");

        test_get_missing($store).await;
        println!("  test_get_missing: PASSED");

        // claim
        test_claim_oldest_first($store).await;
        println!("  test_claim_oldest_first: PASSED");

        test_claim_respects_staleness($store).await;
        println!("  test_claim_respects_staleness: PASSED");

        test_claim_single_winner($store).await;
        println!("  test_claim_single_winner: PASSED");

        // set_meta / set_info
        test_set_meta_gated($store).await;
        println!("  test_set_meta_gated: PASSED");

        test_set_info_gated($store).await;
        println!("  test_set_info_gated: PASSED");

        test_set_meta_missing($store).await;
        println!("  test_set_meta_missing: PASSED");

        // processed / restore / remove
        test_processed_updates_record($store).await;
        println!("  test_processed_updates_record: PASSED");

        test_processed_uses_discussion_timestamp($store).await;
        println!("  test_processed_uses_discussion_timestamp: PASSED");

        test_restore_keeps_content($store).await;
        println!("  test_restore_keeps_content: PASSED");

        test_fail_counts_until_processed($store).await;
        println!("  test_fail_counts_until_processed: PASSED");

        test_claim_skips_listed_cids($store).await;
        println!("  test_claim_skips_listed_cids: PASSED");

        test_remove($store).await;
        println!("  test_remove: PASSED");

        // find / count
        test_find_newest_first($store).await;
        println!("  test_find_newest_first: PASSED");

        test_count_by_state($store).await;
        println!("  test_count_by_state: PASSED");

        // sweeps
        test_reclaim_stale($store).await;
        println!("  test_reclaim_stale: PASSED");

        test_reset_states($store).await;
        println!("  test_reset_states: PASSED");

        test_evict_older_than($store).await;
        println!("  test_evict_older_than: PASSED");
    };
}
