use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::*;
use crate::store::MemoryStore;

#[derive(Debug, Default)]
struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    fn at(now_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicU64::new(now_ms),
        })
    }

    fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

struct UnavailableStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl AccountStore for UnavailableStore {
    async fn account(&self, _: &str, _: u64) -> Result<UserCreditAccount, StoreError> {
        Err(down())
    }

    async fn reserve_one(&self, _: &str, _: u64) -> Result<Option<u64>, StoreError> {
        Err(down())
    }

    async fn refund_one(&self, _: &str, _: u64) -> Result<(), StoreError> {
        Err(down())
    }

    async fn top_up(
        &self,
        _: &str,
        _: u64,
        _: TopUpPolicy,
    ) -> Result<Option<TopUpOutcome>, StoreError> {
        Err(down())
    }

    async fn set_credits(&self, _: &str, _: u64, _: u64) -> Result<(), StoreError> {
        Err(down())
    }

    async fn add_credits(&self, _: &str, _: i64, _: u64) -> Result<u64, StoreError> {
        Err(down())
    }

    async fn record_identity(
        &self,
        _: &str,
        _: &AccountIdentity,
        _: u64,
    ) -> Result<(), StoreError> {
        Err(down())
    }

    async fn delete_account(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, StoreError> {
        Err(down())
    }

    async fn create_credit_request(
        &self,
        _: &str,
        _: &str,
        _: u64,
    ) -> Result<CreditRequest, StoreError> {
        Err(down())
    }

    async fn list_credit_requests(
        &self,
        _: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, StoreError> {
        Err(down())
    }

    async fn review_credit_request(
        &self,
        _: i64,
        _: CreditReview,
        _: u64,
    ) -> Result<CreditRequest, StoreError> {
        Err(down())
    }
}

fn memory_ledger(clock: Arc<ManualClock>) -> CreditLedger {
    CreditLedger::new(Arc::new(MemoryStore::new())).with_clock(clock)
}

#[tokio::test]
async fn concurrent_reservations_grant_exactly_the_balance() {
    let ledger = Arc::new(memory_ledger(ManualClock::at(1_000)));
    ledger.set_balance("alice", 3).await.expect("set");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move { ledger.reserve_one("alice").await }));
    }

    let mut granted = 0;
    for handle in handles {
        let reservation = handle.await.expect("join").expect("reserve");
        if reservation.granted {
            assert!(reservation.remaining >= 0);
            granted += 1;
        } else {
            assert_eq!(reservation.remaining, 0);
        }
    }
    assert_eq!(granted, 3);

    let balance = ledger.get_balance("alice").await.expect("balance");
    assert_eq!(balance.credits, 0);
    assert_eq!(balance.total_generations, 3);
    assert_eq!(ledger.observability().snapshot().reservations_denied, 7);
}

#[tokio::test]
async fn refund_restores_the_pre_reservation_balance() {
    let ledger = memory_ledger(ManualClock::at(1_000));
    ledger.set_balance("alice", 2).await.expect("set");

    let reservation = ledger.reserve_one("alice").await.expect("reserve");
    assert_eq!(
        reservation,
        Reservation {
            granted: true,
            remaining: 1
        }
    );

    ledger.refund_one("alice").await.expect("refund");
    let balance = ledger.get_balance("alice").await.expect("balance");
    assert_eq!(balance.credits, 2);
    assert_eq!(balance.total_generations, 0);
}

#[tokio::test]
async fn unknown_user_is_created_with_zero_credits_and_denied() {
    let ledger = memory_ledger(ManualClock::at(1_000));

    let reservation = ledger.reserve_one("new-user").await.expect("reserve");
    assert!(!reservation.granted);
    assert_eq!(reservation.remaining, 0);

    let account = ledger.account("new-user").await.expect("account");
    assert_eq!(account.credits, 0);
    assert_eq!(account.last_credit_refresh_ms, None);
}

#[tokio::test]
async fn top_up_is_capped_and_idempotent_within_the_window() {
    let clock = ManualClock::at(10 * TOP_UP_WINDOW_MS);
    let ledger = memory_ledger(clock.clone());
    let policy = TopUpPolicy {
        increment: 5,
        cap: 10,
    };
    let nobody = ExemptUserSet::default();

    ledger.set_balance("alice", 8).await.expect("set");
    let outcome = ledger
        .top_up("alice", policy, &nobody)
        .await
        .expect("top up")
        .expect("evaluated");
    assert_eq!(
        outcome,
        TopUpOutcome {
            awarded: 2,
            new_balance: 10,
            capped: true
        }
    );

    clock.advance(TOP_UP_WINDOW_MS - 1);
    assert!(
        ledger
            .top_up("alice", policy, &nobody)
            .await
            .expect("top up")
            .is_none()
    );

    ledger.set_balance("alice", 0).await.expect("drain");
    clock.advance(1);
    let outcome = ledger
        .top_up("alice", policy, &nobody)
        .await
        .expect("top up")
        .expect("evaluated");
    assert_eq!(outcome.awarded, 5);
    assert!(!outcome.capped);
    assert_eq!(ledger.get_balance("alice").await.expect("balance").credits, 5);
}

#[tokio::test]
async fn exempt_accounts_never_top_up() {
    let ledger = memory_ledger(ManualClock::at(10 * TOP_UP_WINDOW_MS))
        .with_exemption(Arc::new(ExemptUserSet::new(["admin"])));

    let summary = ledger.balance_with_top_up("admin").await.expect("summary");
    assert!(summary.exempt);
    assert_eq!(summary.top_up, None);
    assert_eq!(summary.balance.credits, 0);

    let by_closure = |user_id: &str| user_id.starts_with("svc-");
    assert!(
        ledger
            .top_up("svc-batch", TopUpPolicy::default(), &by_closure)
            .await
            .expect("top up")
            .is_none()
    );
    let account = ledger.account("svc-batch").await.expect("account");
    assert_eq!(account.last_credit_refresh_ms, None);
}

#[tokio::test]
async fn balance_read_tops_up_new_accounts_immediately() {
    let ledger = memory_ledger(ManualClock::at(5_000));

    let summary = ledger.balance_with_top_up("bob").await.expect("summary");
    assert!(!summary.exempt);
    assert_eq!(summary.balance.credits, 5);
    assert_eq!(summary.top_up.map(|outcome| outcome.awarded), Some(5));

    let again = ledger.balance_with_top_up("bob").await.expect("summary");
    assert_eq!(again.top_up, None);
    assert_eq!(again.balance.credits, 5);
}

#[tokio::test]
async fn increment_balance_is_additive_and_floors_at_zero() {
    let ledger = memory_ledger(ManualClock::at(1));
    assert_eq!(ledger.increment_balance("alice", 4).await.expect("add"), 4);
    assert_eq!(ledger.increment_balance("alice", 3).await.expect("add"), 7);
    assert_eq!(ledger.increment_balance("alice", -20).await.expect("sub"), 0);
}

#[tokio::test]
async fn store_outage_fails_open_by_default() {
    let ledger = CreditLedger::new(Arc::new(UnavailableStore));

    let reservation = ledger.reserve_one("alice").await.expect("fail open");
    assert!(reservation.granted);
    assert_eq!(reservation.remaining, UNKNOWN_REMAINING);
    assert!(reservation.is_unbacked());
    assert_eq!(ledger.observability().snapshot().store_degraded, 1);
}

#[tokio::test]
async fn store_outage_fails_closed_when_configured() {
    let ledger = CreditLedger::new(Arc::new(UnavailableStore))
        .with_failure_policy(StoreFailurePolicy::FailClosed);

    let err = ledger.reserve_one("alice").await.expect_err("fail closed");
    assert!(matches!(err, LedgerError::StoreUnavailable(_)));

    let err = ledger.get_balance("alice").await.expect_err("balance");
    assert!(matches!(err, LedgerError::StoreUnavailable(_)));
}

#[tokio::test]
async fn blank_user_ids_are_rejected() {
    let ledger = memory_ledger(ManualClock::at(1));
    assert!(matches!(
        ledger.reserve_one("  ").await,
        Err(LedgerError::InvalidUserId)
    ));
}

#[tokio::test]
async fn domain_errors_are_not_reported_as_outages() {
    let ledger = memory_ledger(ManualClock::at(1));
    let err = ledger
        .review_credit_request(42, CreditReview::deny())
        .await
        .expect_err("missing request");
    assert!(matches!(
        err,
        LedgerError::Store(StoreError::CreditRequestNotFound { id: 42 })
    ));
}
