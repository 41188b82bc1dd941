//! ContextStore interface tests.
//!
//! These tests verify the contract of the ContextStore trait. They expect a
//! fresh store and run in the order of the runner macro.

use chrono::{TimeZone, Utc};

use osmtracker::model::{FeedType, PointerPosition};
use osmtracker::storage::{ContextStore, StorageError};

/// Create a minute feed position.
pub fn make_position(seqno: u64) -> PointerPosition {
    PointerPosition {
        stype: FeedType::Minute,
        seqno,
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

pub async fn test_pointer_initially_unset<S: ContextStore>(store: &S) {
    assert!(store.pointer().await.unwrap().is_none());
    assert!(matches!(
        store.pointer_advance(1).await,
        Err(StorageError::NoPointer)
    ));
    assert!(matches!(
        store.pointer_update_timestamp(Utc::now()).await,
        Err(StorageError::NoPointer)
    ));
}

pub async fn test_set_pointer_records_first_pointer<S: ContextStore>(store: &S) {
    let pointer = store.set_pointer(&make_position(100)).await.unwrap();
    assert_eq!(pointer.seqno, 100);
    assert_eq!(pointer.first_pointer, Some(make_position(100)));

    let moved = store.set_pointer(&make_position(200)).await.unwrap();
    assert_eq!(moved.seqno, 200);
    assert_eq!(
        moved.first_pointer,
        Some(make_position(100)),
        "first pointer should only be recorded once"
    );

    let stored = store.pointer().await.unwrap().unwrap();
    assert_eq!(stored, moved);
}

pub async fn test_pointer_advance_and_timestamp<S: ContextStore>(store: &S) {
    let consumed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
    store.pointer_update_timestamp(consumed).await.unwrap();
    let pointer = store.pointer_advance(3).await.unwrap();
    assert_eq!(pointer.seqno, 203);
    assert_eq!(pointer.timestamp, consumed);

    let back = store.pointer_advance(-1).await.unwrap();
    assert_eq!(back.seqno, 202);
    assert_eq!(store.pointer().await.unwrap().unwrap().seqno, 202);
}

pub async fn test_generation_counter<S: ContextStore>(store: &S) {
    assert_eq!(store.generation().await.unwrap(), 0);
    assert_eq!(store.generation_advance().await.unwrap(), 1);
    assert_eq!(store.generation_advance().await.unwrap(), 2);
    assert_eq!(store.generation().await.unwrap(), 2);
}

/// Run all ContextStore interface tests against a fresh store.
#[macro_export]
macro_rules! run_context_store_tests {
    ($store:expr) => {
        use $crate::storage::context_store_tests::*;

        test_pointer_initially_unset($store).await;
        println!("  test_pointer_initially_unset: PASSED");

        test_set_pointer_records_first_pointer($store).await;
        println!("  test_set_pointer_records_first_pointer: PASSED");

        test_pointer_advance_and_timestamp($store).await;
        println!("  test_pointer_advance_and_timestamp: PASSED");

        test_generation_counter($store).await;
        println!("  test_generation_counter: PASSED");
    };
}
