#![cfg(feature = "store-sqlite")]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ditto_credits::ledger::TOP_UP_WINDOW_MS;
use ditto_credits::{
    AdmissionQueue, Clock, CreditGate, CreditLedger, CreditReview, GenerationError, SqliteStore,
};

struct FixedClock(AtomicU64);

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

async fn ledger_at(path: &std::path::Path, clock: Arc<FixedClock>) -> CreditLedger {
    let store = SqliteStore::new(path);
    store.init().await.expect("init");
    CreditLedger::new(Arc::new(store)).with_clock(clock)
}

#[tokio::test]
async fn balances_and_refresh_times_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("credits.sqlite");
    let clock = Arc::new(FixedClock(AtomicU64::new(3 * TOP_UP_WINDOW_MS)));

    {
        let ledger = ledger_at(&path, clock.clone()).await;
        let summary = ledger.balance_with_top_up("alice").await.expect("summary");
        assert_eq!(summary.balance.credits, 5);

        let gate = CreditGate::new(Arc::new(ledger), Arc::new(AdmissionQueue::new(1)));
        gate.run("alice", || async { Ok(()) }).await.expect("charged");
        gate.run("alice", || async {
            Err::<(), _>(GenerationError::Interrupted("worker restarted".to_string()))
        })
        .await
        .expect_err("refunded");
    }

    clock.0.fetch_add(1_000, Ordering::SeqCst);
    let ledger = ledger_at(&path, clock.clone()).await;
    let summary = ledger.balance_with_top_up("alice").await.expect("summary");
    assert_eq!(summary.top_up, None);
    assert_eq!(summary.balance.credits, 4);
    assert_eq!(summary.balance.total_generations, 1);

    clock.0.fetch_add(TOP_UP_WINDOW_MS, Ordering::SeqCst);
    let summary = ledger.balance_with_top_up("alice").await.expect("summary");
    let top_up = summary.top_up.expect("window elapsed");
    assert_eq!(top_up.awarded, 5);
    assert_eq!(summary.balance.credits, 9);
}

#[tokio::test]
async fn credit_requests_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("credits.sqlite");
    let clock = Arc::new(FixedClock(AtomicU64::new(1_000)));

    let id = {
        let ledger = ledger_at(&path, clock.clone()).await;
        ledger
            .create_credit_request("bob", "for the demo")
            .await
            .expect("create")
            .id
    };

    let ledger = ledger_at(&path, clock).await;
    let reviewed = ledger
        .review_credit_request(id, CreditReview::approve(2))
        .await
        .expect("review");
    assert_eq!(reviewed.message, "for the demo");
    assert_eq!(ledger.get_balance("bob").await.expect("balance").credits, 2);
}
