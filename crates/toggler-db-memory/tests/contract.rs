use std::sync::Arc;

use toggler_db_memory::InMemoryStorage;
use toggler_storage::{DeliveryMode, Storage};
use toggler_test_utils::{CountingStorage, contract};

#[tokio::test]
async fn in_memory_storage_satisfies_contract() {
    let storage = InMemoryStorage::new();
    contract::run_all(&storage).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_memory_storage_with_background_delivery_satisfies_contract() {
    let storage = InMemoryStorage::with_delivery(DeliveryMode::background());
    contract::run_all(&storage).await;
}

#[tokio::test]
async fn counting_wrapper_is_transparent() {
    let inner: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let storage = CountingStorage::new(inner);
    contract::run_all(&storage).await;
    assert!(storage.calls("create") > 0);
    assert!(storage.calls("begin_tx") > 0);
}
