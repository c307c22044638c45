use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AccountIdentity, AccountStore, CreditRequest, CreditRequestStatus, CreditReview, StoreError,
    UserCreditAccount, apply_delta,
};
use crate::ledger::{TopUpOutcome, TopUpPolicy, apply_top_up};

/// Single-process store. Balances are shared only within this process, so it
/// suits tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<String, UserCreditAccount>,
    credit_requests: Vec<CreditRequest>,
    next_request_id: i64,
}

impl MemoryState {
    fn entry(&mut self, user_id: &str, now_ms: u64) -> &mut UserCreditAccount {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| UserCreditAccount::new(user_id, now_ms))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn account(&self, user_id: &str, now_ms: u64) -> Result<UserCreditAccount, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.entry(user_id, now_ms).clone())
    }

    async fn reserve_one(&self, user_id: &str, now_ms: u64) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().await;
        let account = state.entry(user_id, now_ms);
        if account.credits == 0 {
            return Ok(None);
        }
        account.credits -= 1;
        account.total_generations = account.total_generations.saturating_add(1);
        account.updated_at_ms = now_ms;
        Ok(Some(account.credits))
    }

    async fn refund_one(&self, user_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state.entry(user_id, now_ms);
        account.credits = account.credits.saturating_add(1);
        account.total_generations = account.total_generations.saturating_sub(1);
        account.updated_at_ms = now_ms;
        Ok(())
    }

    async fn top_up(
        &self,
        user_id: &str,
        now_ms: u64,
        policy: TopUpPolicy,
    ) -> Result<Option<TopUpOutcome>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(apply_top_up(state.entry(user_id, now_ms), now_ms, policy))
    }

    async fn set_credits(
        &self,
        user_id: &str,
        credits: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state.entry(user_id, now_ms);
        account.credits = credits;
        account.updated_at_ms = now_ms;
        Ok(())
    }

    async fn add_credits(
        &self,
        user_id: &str,
        delta: i64,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let account = state.entry(user_id, now_ms);
        account.credits = apply_delta(account.credits, delta);
        account.updated_at_ms = now_ms;
        Ok(account.credits)
    }

    async fn record_identity(
        &self,
        user_id: &str,
        identity: &AccountIdentity,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state.entry(user_id, now_ms);
        if account.absorb_identity(identity) {
            account.updated_at_ms = now_ms;
        }
        Ok(())
    }

    async fn delete_account(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.accounts.remove(user_id).is_some())
    }

    async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<UserCreditAccount> = state.accounts.values().cloned().collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }

    async fn create_credit_request(
        &self,
        user_id: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError> {
        let mut state = self.state.lock().await;
        state.next_request_id += 1;
        let request = CreditRequest {
            id: state.next_request_id,
            user_id: user_id.to_string(),
            message: message.to_string(),
            status: CreditRequestStatus::Pending,
            created_at_ms: now_ms,
            reviewed_at_ms: None,
            credits_granted: 0,
        };
        state.credit_requests.push(request.clone());
        Ok(request)
    }

    async fn list_credit_requests(
        &self,
        status: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .credit_requests
            .iter()
            .rev()
            .filter(|request| status.is_none_or(|status| request.status == status))
            .cloned()
            .collect())
    }

    async fn review_credit_request(
        &self,
        id: i64,
        review: CreditReview,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError> {
        if review.status == CreditRequestStatus::Pending {
            return Err(StoreError::PendingReview);
        }

        let mut state = self.state.lock().await;
        let request = state
            .credit_requests
            .iter_mut()
            .find(|request| request.id == id)
            .ok_or(StoreError::CreditRequestNotFound { id })?;
        if request.status != CreditRequestStatus::Pending {
            return Err(StoreError::AlreadyReviewed {
                id,
                status: request.status,
            });
        }

        request.status = review.status;
        request.reviewed_at_ms = Some(now_ms);
        request.credits_granted = review.granted_credits();
        let reviewed = request.clone();

        if reviewed.credits_granted > 0 {
            let account = state.entry(&reviewed.user_id, now_ms);
            account.credits = account.credits.saturating_add(reviewed.credits_granted);
            account.updated_at_ms = now_ms;
        }
        Ok(reviewed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_creates_accounts_lazily_with_zero_credits() {
        let store = MemoryStore::new();
        assert_eq!(store.reserve_one("u1", 1).await.expect("reserve"), None);

        let account = store.account("u1", 2).await.expect("account");
        assert_eq!(account.credits, 0);
        assert_eq!(account.total_generations, 0);
        assert_eq!(account.created_at_ms, 1);
    }

    #[tokio::test]
    async fn memory_store_add_credits_floors_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.add_credits("u1", 3, 1).await.expect("add"), 3);
        assert_eq!(store.add_credits("u1", -10, 2).await.expect("sub"), 0);
    }

    #[tokio::test]
    async fn memory_store_reviews_credit_requests_once() {
        let store = MemoryStore::new();
        let request = store
            .create_credit_request("u1", "need more", 1)
            .await
            .expect("create");

        let reviewed = store
            .review_credit_request(request.id, CreditReview::approve(4), 2)
            .await
            .expect("review");
        assert_eq!(reviewed.status, CreditRequestStatus::Approved);
        assert_eq!(reviewed.reviewed_at_ms, Some(2));
        assert_eq!(store.account("u1", 3).await.expect("account").credits, 4);

        let err = store
            .review_credit_request(request.id, CreditReview::deny(), 3)
            .await;
        assert!(matches!(err, Err(StoreError::AlreadyReviewed { .. })));

        let err = store
            .review_credit_request(99, CreditReview::deny(), 3)
            .await;
        assert!(matches!(
            err,
            Err(StoreError::CreditRequestNotFound { id: 99 })
        ));
    }

    #[tokio::test]
    async fn memory_store_identity_is_written_once() {
        let store = MemoryStore::new();
        let first = AccountIdentity {
            email: Some("a@example.com".to_string()),
            display_name: Some("  ".to_string()),
        };
        store.record_identity("u1", &first, 1).await.expect("first");

        let second = AccountIdentity {
            email: Some("b@example.com".to_string()),
            display_name: Some("Ada".to_string()),
        };
        store.record_identity("u1", &second, 2).await.expect("second");

        let account = store.account("u1", 3).await.expect("account");
        assert_eq!(account.email.as_deref(), Some("a@example.com"));
        assert_eq!(account.display_name.as_deref(), Some("Ada"));
    }
}
