//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite
//!
//! Each test uses a database file in its own temporary directory, so the
//! pool's connections all see the same data.

mod storage;

use osmtracker::storage::{SqliteChangesetStore, SqliteContextStore};

async fn connect(dir: &tempfile::TempDir) -> sqlx::SqlitePool {
    let path = dir.path().join("osmtracker.db");
    sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .expect("Failed to connect to SQLite")
}

#[tokio::test]
async fn test_sqlite_changeset_store() {
    println!("=== SQLite ChangesetStore Tests ===");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = connect(&dir).await;
    let store = SqliteChangesetStore::new(pool);
    store.init().await.expect("Failed to create schema");

    run_changeset_store_tests!(&store);

    println!("=== All SQLite ChangesetStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_context_store() {
    println!("=== SQLite ContextStore Tests ===");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = connect(&dir).await;
    let store = SqliteContextStore::new(pool);
    store.init().await.expect("Failed to create schema");

    run_context_store_tests!(&store);

    println!("=== All SQLite ContextStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_schema_init_is_idempotent() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = connect(&dir).await;
    let changesets = SqliteChangesetStore::new(pool.clone());
    let context = SqliteContextStore::new(pool);

    changesets.init().await.unwrap();
    context.init().await.unwrap();
    changesets.init().await.unwrap();
    context.init().await.unwrap();
}
