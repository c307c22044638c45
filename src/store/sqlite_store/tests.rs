use std::sync::Arc;

use super::*;
use crate::ledger::TOP_UP_WINDOW_MS;

async fn temp_store(dir: &tempfile::TempDir) -> SqliteStore {
    let store = SqliteStore::new(dir.path().join("credits.sqlite"));
    store.init().await.expect("init");
    store
}

#[tokio::test]
async fn sqlite_store_reserve_and_refund_round_trip_balance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = temp_store(&dir).await;

    store.set_credits("u1", 2, 1).await.expect("set");
    assert_eq!(store.reserve_one("u1", 2).await.expect("r1"), Some(1));
    assert_eq!(store.reserve_one("u1", 3).await.expect("r2"), Some(0));
    assert_eq!(store.reserve_one("u1", 4).await.expect("r3"), None);

    store.refund_one("u1", 5).await.expect("refund");
    let account = store.account("u1", 6).await.expect("account");
    assert_eq!(account.credits, 1);
    assert_eq!(account.total_generations, 1);
    assert_eq!(account.updated_at_ms, 5);
}

#[tokio::test]
async fn sqlite_store_concurrent_reservations_never_overspend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(temp_store(&dir).await);
    store.set_credits("u1", 3, 1).await.expect("set");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.reserve_one("u1", 2).await }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.expect("join").expect("reserve").is_some() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);

    let account = store.account("u1", 3).await.expect("account");
    assert_eq!(account.credits, 0);
    assert_eq!(account.total_generations, 3);
}

#[tokio::test]
async fn sqlite_store_top_up_persists_refresh_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = temp_store(&dir).await;
    let policy = TopUpPolicy {
        increment: 5,
        cap: 10,
    };

    store.set_credits("u1", 8, 0).await.expect("set");
    let first = store
        .top_up("u1", TOP_UP_WINDOW_MS, policy)
        .await
        .expect("top up")
        .expect("eligible");
    assert_eq!(first.awarded, 2);
    assert!(first.capped);

    let second = store
        .top_up("u1", TOP_UP_WINDOW_MS + 1_000, policy)
        .await
        .expect("top up");
    assert!(second.is_none());

    let account = store.account("u1", TOP_UP_WINDOW_MS + 2_000).await.expect("account");
    assert_eq!(account.credits, 10);
    assert_eq!(account.last_credit_refresh_ms, Some(TOP_UP_WINDOW_MS));
}

#[tokio::test]
async fn sqlite_store_add_credits_floors_at_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = temp_store(&dir).await;

    assert_eq!(store.add_credits("u1", 4, 1).await.expect("add"), 4);
    assert_eq!(store.add_credits("u1", -9, 2).await.expect("sub"), 0);
}

#[tokio::test]
async fn sqlite_store_credit_requests_are_reviewed_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = temp_store(&dir).await;

    let first = store
        .create_credit_request("u1", "more please", 1)
        .await
        .expect("create first");
    let second = store
        .create_credit_request("u2", "me too", 2)
        .await
        .expect("create second");

    let approved = store
        .review_credit_request(first.id, CreditReview::approve(3), 5)
        .await
        .expect("approve");
    assert_eq!(approved.status, CreditRequestStatus::Approved);
    assert_eq!(approved.credits_granted, 3);
    assert_eq!(store.account("u1", 6).await.expect("account").credits, 3);

    let err = store
        .review_credit_request(first.id, CreditReview::deny(), 7)
        .await;
    assert!(matches!(err, Err(StoreError::AlreadyReviewed { .. })));

    let pending = store
        .list_credit_requests(Some(CreditRequestStatus::Pending))
        .await
        .expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second.id);

    let all = store.list_credit_requests(None).await.expect("all");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id);
}

#[tokio::test]
async fn sqlite_store_lists_and_deletes_accounts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = temp_store(&dir).await;

    store.set_credits("b", 1, 1).await.expect("set b");
    store.set_credits("a", 2, 1).await.expect("set a");
    store
        .record_identity(
            "a",
            &AccountIdentity {
                email: Some("a@example.com".to_string()),
                display_name: None,
            },
            2,
        )
        .await
        .expect("identity");

    let accounts = store.list_accounts().await.expect("list");
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].user_id, "a");
    assert_eq!(accounts[0].email.as_deref(), Some("a@example.com"));

    assert!(store.delete_account("a").await.expect("delete"));
    assert!(!store.delete_account("a").await.expect("delete again"));
    assert_eq!(store.list_accounts().await.expect("list").len(), 1);
}
