//! Per-user credit accounting.
//!
//! [`CreditLedger`] owns no balances itself. Every read and mutation goes to
//! the configured [`AccountStore`], so several server processes sharing one
//! store see the same balances.

mod exempt;
mod top_up;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::Observability;
use crate::store::{
    AccountIdentity, AccountStore, CreditRequest, CreditRequestStatus, CreditReview, StoreError,
    UserCreditAccount,
};

pub use exempt::{ExemptUserSet, ExemptionPolicy};
pub use top_up::{TOP_UP_WINDOW_MS, TopUpOutcome, TopUpPolicy, apply_top_up, evaluate_top_up};

/// Reported as `remaining` when a request was admitted while the store could
/// not be reached.
pub const UNKNOWN_REMAINING: i64 = -1;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// What [`CreditLedger::reserve_one`] does when the store errors out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request without a reservation and report
    /// [`UNKNOWN_REMAINING`].
    #[default]
    FailOpen,
    /// Reject the request with [`LedgerError::StoreUnavailable`].
    FailClosed,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user id must not be empty")]
    InvalidUserId,
    #[error("account store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            Self::StoreUnavailable(err)
        } else {
            Self::Store(err)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub granted: bool,
    /// Post-decrement balance, `0` when not granted, or [`UNKNOWN_REMAINING`].
    pub remaining: i64,
}

impl Reservation {
    fn granted(remaining: u64) -> Self {
        Self {
            granted: true,
            remaining: i64::try_from(remaining).unwrap_or(i64::MAX),
        }
    }

    fn denied() -> Self {
        Self {
            granted: false,
            remaining: 0,
        }
    }

    fn unknown() -> Self {
        Self {
            granted: true,
            remaining: UNKNOWN_REMAINING,
        }
    }

    /// The reservation was taken without the store, so there is nothing to
    /// refund.
    pub fn is_unbacked(&self) -> bool {
        self.granted && self.remaining == UNKNOWN_REMAINING
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub credits: u64,
    pub total_generations: u64,
}

impl From<&UserCreditAccount> for Balance {
    fn from(account: &UserCreditAccount) -> Self {
        Self {
            credits: account.credits,
            total_generations: account.total_generations,
        }
    }
}

/// Balance as seen by the account owner, after the lazy daily top-up ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSummary {
    #[serde(flatten)]
    pub balance: Balance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_up: Option<TopUpOutcome>,
    pub exempt: bool,
}

pub struct CreditLedger {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    top_up_policy: TopUpPolicy,
    exemption: Arc<dyn ExemptionPolicy>,
    failure_policy: StoreFailurePolicy,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("top_up_policy", &self.top_up_policy)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            top_up_policy: TopUpPolicy::default(),
            exemption: Arc::new(ExemptUserSet::default()),
            failure_policy: StoreFailurePolicy::default(),
            observability: Arc::new(Observability::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_top_up_policy(mut self, policy: TopUpPolicy) -> Self {
        self.top_up_policy = policy;
        self
    }

    pub fn with_exemption(mut self, exemption: Arc<dyn ExemptionPolicy>) -> Self {
        self.exemption = exemption;
        self
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn top_up_policy(&self) -> TopUpPolicy {
        self.top_up_policy
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.failure_policy
    }

    pub fn is_exempt(&self, user_id: &str) -> bool {
        self.exemption.is_exempt(user_id)
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Takes one credit from `user_id`, creating the account on first use.
    pub async fn reserve_one(&self, user_id: &str) -> Result<Reservation, LedgerError> {
        ensure_user_id(user_id)?;
        match self.store.reserve_one(user_id, self.now_ms()).await {
            Ok(Some(remaining)) => {
                self.observability.record_reservation_granted();
                tracing::debug!(user_id, remaining, "credit reserved");
                Ok(Reservation::granted(remaining))
            }
            Ok(None) => {
                self.observability.record_reservation_denied();
                tracing::debug!(user_id, "credit reservation denied: balance is zero");
                Ok(Reservation::denied())
            }
            Err(err) if err.is_unavailable() => {
                self.observability.record_store_degraded();
                match self.failure_policy {
                    StoreFailurePolicy::FailOpen => {
                        tracing::warn!(
                            user_id,
                            error = %err,
                            "account store unavailable; admitting request without a reservation"
                        );
                        Ok(Reservation::unknown())
                    }
                    StoreFailurePolicy::FailClosed => {
                        tracing::warn!(
                            user_id,
                            error = %err,
                            "account store unavailable; rejecting request"
                        );
                        Err(LedgerError::StoreUnavailable(err))
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns one credit. Each successful reservation may be refunded at
    /// most once.
    pub async fn refund_one(&self, user_id: &str) -> Result<(), LedgerError> {
        ensure_user_id(user_id)?;
        self.store.refund_one(user_id, self.now_ms()).await?;
        self.observability.record_refund();
        tracing::debug!(user_id, "credit refunded");
        Ok(())
    }

    /// Runs the daily top-up for `user_id` unless `exempt` says otherwise.
    /// `None` means no evaluation happened: the account is exempt or its
    /// window has not elapsed.
    pub async fn top_up(
        &self,
        user_id: &str,
        policy: TopUpPolicy,
        exempt: &dyn ExemptionPolicy,
    ) -> Result<Option<TopUpOutcome>, LedgerError> {
        ensure_user_id(user_id)?;
        if exempt.is_exempt(user_id) {
            return Ok(None);
        }

        let outcome = self.store.top_up(user_id, self.now_ms(), policy).await?;
        if let Some(outcome) = outcome {
            self.observability.record_top_up();
            tracing::info!(
                user_id,
                awarded = outcome.awarded,
                new_balance = outcome.new_balance,
                capped = outcome.capped,
                "daily credit top-up evaluated"
            );
        }
        Ok(outcome)
    }

    /// [`Self::top_up`] with the configured policy and exemptions.
    pub async fn daily_top_up(&self, user_id: &str) -> Result<Option<TopUpOutcome>, LedgerError> {
        self.top_up(user_id, self.top_up_policy, self.exemption.as_ref())
            .await
    }

    /// The balance read used by account owners: applies the configured
    /// top-up policy first, then reads.
    pub async fn balance_with_top_up(&self, user_id: &str) -> Result<CreditSummary, LedgerError> {
        let exempt = self.is_exempt(user_id);
        let top_up = self.daily_top_up(user_id).await?;
        let balance = self.get_balance(user_id).await?;
        Ok(CreditSummary {
            balance,
            top_up,
            exempt,
        })
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        let account = self.account(user_id).await?;
        Ok(Balance::from(&account))
    }

    pub async fn account(&self, user_id: &str) -> Result<UserCreditAccount, LedgerError> {
        ensure_user_id(user_id)?;
        Ok(self.store.account(user_id, self.now_ms()).await?)
    }

    pub async fn set_balance(&self, user_id: &str, credits: u64) -> Result<(), LedgerError> {
        ensure_user_id(user_id)?;
        self.store
            .set_credits(user_id, credits, self.now_ms())
            .await?;
        tracing::info!(user_id, credits, "credit balance set");
        Ok(())
    }

    /// Adds `delta` credits, flooring the result at zero. Returns the new
    /// balance.
    pub async fn increment_balance(&self, user_id: &str, delta: i64) -> Result<u64, LedgerError> {
        ensure_user_id(user_id)?;
        let credits = self
            .store
            .add_credits(user_id, delta, self.now_ms())
            .await?;
        tracing::info!(user_id, delta, credits, "credit balance incremented");
        Ok(credits)
    }

    pub async fn record_identity(
        &self,
        user_id: &str,
        identity: &AccountIdentity,
    ) -> Result<(), LedgerError> {
        ensure_user_id(user_id)?;
        if identity.is_empty() {
            return Ok(());
        }
        Ok(self
            .store
            .record_identity(user_id, identity, self.now_ms())
            .await?)
    }

    pub async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, LedgerError> {
        Ok(self.store.list_accounts().await?)
    }

    pub async fn delete_account(&self, user_id: &str) -> Result<bool, LedgerError> {
        ensure_user_id(user_id)?;
        let removed = self.store.delete_account(user_id).await?;
        if removed {
            tracing::info!(user_id, "account deleted");
        }
        Ok(removed)
    }

    pub async fn create_credit_request(
        &self,
        user_id: &str,
        message: &str,
    ) -> Result<CreditRequest, LedgerError> {
        ensure_user_id(user_id)?;
        let request = self
            .store
            .create_credit_request(user_id, message.trim(), self.now_ms())
            .await?;
        tracing::info!(user_id, request_id = request.id, "credit request created");
        Ok(request)
    }

    pub async fn list_credit_requests(
        &self,
        status: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, LedgerError> {
        Ok(self.store.list_credit_requests(status).await?)
    }

    pub async fn review_credit_request(
        &self,
        id: i64,
        review: CreditReview,
    ) -> Result<CreditRequest, LedgerError> {
        let request = self
            .store
            .review_credit_request(id, review, self.now_ms())
            .await?;
        tracing::info!(
            request_id = id,
            user_id = %request.user_id,
            status = %request.status,
            credits_granted = request.credits_granted,
            "credit request reviewed"
        );
        Ok(request)
    }
}

fn ensure_user_id(user_id: &str) -> Result<(), LedgerError> {
    if user_id.trim().is_empty() {
        return Err(LedgerError::InvalidUserId);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
