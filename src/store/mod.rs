//! Transactional account storage.
//!
//! Every mutating method on [`AccountStore`] is one atomic step with respect to
//! every other method touching the same account. Backends get there in their
//! own way: the memory store holds a single lock, SQLite runs an immediate
//! transaction, Redis runs one Lua script per call.

mod memory;
#[cfg(feature = "store-redis")]
mod redis_store;
#[cfg(feature = "store-sqlite")]
mod sqlite_store;
mod store_types;

use async_trait::async_trait;
use thiserror::Error;

use crate::ledger::{TopUpOutcome, TopUpPolicy};

pub use memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
pub use store_types::{
    AccountIdentity, CreditRequest, CreditRequestStatus, CreditReview, UserCreditAccount,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credit request not found: {id}")]
    CreditRequestNotFound { id: i64 },
    #[error("credit request {id} was already reviewed as {status}")]
    AlreadyReviewed {
        id: i64,
        status: CreditRequestStatus,
    },
    #[error("a review must approve or deny the request")]
    PendingReview,
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error means the backend could not be reached or failed,
    /// as opposed to a domain rejection.
    pub fn is_unavailable(&self) -> bool {
        !matches!(
            self,
            Self::CreditRequestNotFound { .. } | Self::AlreadyReviewed { .. } | Self::PendingReview
        )
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Loads the account, creating it with zero credits if absent.
    async fn account(&self, user_id: &str, now_ms: u64) -> Result<UserCreditAccount, StoreError>;

    /// Takes one credit if any is left. Returns the post-decrement balance, or
    /// `None` when the balance was already zero.
    async fn reserve_one(&self, user_id: &str, now_ms: u64) -> Result<Option<u64>, StoreError>;

    async fn refund_one(&self, user_id: &str, now_ms: u64) -> Result<(), StoreError>;

    async fn top_up(
        &self,
        user_id: &str,
        now_ms: u64,
        policy: TopUpPolicy,
    ) -> Result<Option<TopUpOutcome>, StoreError>;

    async fn set_credits(&self, user_id: &str, credits: u64, now_ms: u64)
    -> Result<(), StoreError>;

    /// Adds `delta` to the balance, flooring at zero. Returns the new balance.
    async fn add_credits(&self, user_id: &str, delta: i64, now_ms: u64)
    -> Result<u64, StoreError>;

    /// Writes identity fields that are still empty on the account.
    async fn record_identity(
        &self,
        user_id: &str,
        identity: &AccountIdentity,
        now_ms: u64,
    ) -> Result<(), StoreError>;

    async fn delete_account(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, StoreError>;

    async fn create_credit_request(
        &self,
        user_id: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError>;

    /// Newest first.
    async fn list_credit_requests(
        &self,
        status: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, StoreError>;

    /// Moves a pending request to its final status. Approved credits land on
    /// the requester's balance in the same atomic step.
    async fn review_credit_request(
        &self,
        id: i64,
        review: CreditReview,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError>;
}

pub(crate) fn apply_delta(credits: u64, delta: i64) -> u64 {
    if delta >= 0 {
        credits.saturating_add(delta.unsigned_abs())
    } else {
        credits.saturating_sub(delta.unsigned_abs())
    }
}
