//! The store refuses production adapters inside a test run.

mod common;

use boardkeep::{FileAdapter, SqliteAdapter, Store, StoreError};

#[tokio::test]
async fn test_non_test_adapters_rejected_when_env_marks_test() {
    common::mark_test_run();

    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("board.json");

    let err = Store::new(FileAdapter::new(&path)).err().expect("file adapter must be rejected");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::UnsafeAdapter(_))));
    assert!(err.to_string().contains("FileAdapter::for_tests"));
    assert!(!path.exists(), "rejected adapter must not touch the file");

    let err = Store::new(SqliteAdapter::in_memory().unwrap())
        .err()
        .expect("sqlite adapter must be rejected");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::UnsafeAdapter(_))));

    assert!(Store::open(FileAdapter::for_tests(&path)).await.is_ok());
    assert!(Store::open(SqliteAdapter::for_tests().unwrap()).await.is_ok());
}
