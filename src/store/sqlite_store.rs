use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::{
    AccountIdentity, AccountStore, CreditRequest, CreditRequestStatus, CreditReview, StoreError,
    UserCreditAccount,
};
use crate::ledger::{TopUpOutcome, TopUpPolicy, apply_top_up};

const ACCOUNT_COLUMNS: &str = "user_id, credits, total_generations, last_credit_refresh_ms, \
     email, display_name, created_at_ms, updated_at_ms";

const CREDIT_REQUEST_COLUMNS: &str =
    "id, user_id, message, status, created_at_ms, reviewed_at_ms, credits_granted";

/// SQLite-backed store. Each call opens its own connection and runs inside an
/// immediate transaction, so separate processes sharing the file serialize
/// their writes through SQLite's lock.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_connection(|_| Ok(())).await
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn account(&self, user_id: &str, now_ms: u64) -> Result<UserCreditAccount, StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let account = load_or_create_account(&tx, &user_id, now_ms)?;
            tx.commit()?;
            Ok(account)
        })
        .await
    }

    async fn reserve_one(&self, user_id: &str, now_ms: u64) -> Result<Option<u64>, StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &user_id, now_ms)?;
            let remaining: Option<i64> = tx
                .query_row(
                    "UPDATE accounts
                     SET credits = credits - 1,
                         total_generations = total_generations + 1,
                         updated_at_ms = ?2
                     WHERE user_id = ?1 AND credits > 0
                     RETURNING credits",
                    rusqlite::params![user_id, u64_to_i64(now_ms)],
                    |row| row.get(0),
                )
                .optional()?;
            tx.commit()?;
            Ok(remaining.map(i64_to_u64))
        })
        .await
    }

    async fn refund_one(&self, user_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &user_id, now_ms)?;
            tx.execute(
                "UPDATE accounts
                 SET credits = credits + 1,
                     total_generations = CASE WHEN total_generations > 0 THEN total_generations - 1 ELSE 0 END,
                     updated_at_ms = ?2
                 WHERE user_id = ?1",
                rusqlite::params![user_id, u64_to_i64(now_ms)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn top_up(
        &self,
        user_id: &str,
        now_ms: u64,
        policy: TopUpPolicy,
    ) -> Result<Option<TopUpOutcome>, StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut account = load_or_create_account(&tx, &user_id, now_ms)?;
            let outcome = apply_top_up(&mut account, now_ms, policy);
            if outcome.is_some() {
                tx.execute(
                    "UPDATE accounts
                     SET credits = ?2,
                         last_credit_refresh_ms = ?3,
                         updated_at_ms = ?4
                     WHERE user_id = ?1",
                    rusqlite::params![
                        user_id,
                        u64_to_i64(account.credits),
                        account.last_credit_refresh_ms.map(u64_to_i64),
                        u64_to_i64(account.updated_at_ms),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn set_credits(
        &self,
        user_id: &str,
        credits: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &user_id, now_ms)?;
            tx.execute(
                "UPDATE accounts SET credits = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, u64_to_i64(credits), u64_to_i64(now_ms)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn add_credits(
        &self,
        user_id: &str,
        delta: i64,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &user_id, now_ms)?;
            let credits: i64 = tx.query_row(
                "UPDATE accounts
                 SET credits = MAX(0, credits + ?2),
                     updated_at_ms = ?3
                 WHERE user_id = ?1
                 RETURNING credits",
                rusqlite::params![user_id, delta, u64_to_i64(now_ms)],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(i64_to_u64(credits))
        })
        .await
    }

    async fn record_identity(
        &self,
        user_id: &str,
        identity: &AccountIdentity,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let identity = identity.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut account = load_or_create_account(&tx, &user_id, now_ms)?;
            if account.absorb_identity(&identity) {
                tx.execute(
                    "UPDATE accounts
                     SET email = ?2, display_name = ?3, updated_at_ms = ?4
                     WHERE user_id = ?1",
                    rusqlite::params![
                        user_id,
                        account.email,
                        account.display_name,
                        u64_to_i64(now_ms)
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_account(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let removed = conn.execute(
                "DELETE FROM accounts WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<UserCreditAccount>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY user_id"
            ))?;
            let rows = stmt.query_map([], account_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn create_credit_request(
        &self,
        user_id: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<CreditRequest, StoreError> {
        let user_id = user_id.to_string();
        let message = message.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO credit_requests (user_id, message, status, created_at_ms, credits_granted)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                rusqlite::params![
                    user_id,
                    message,
                    CreditRequestStatus::Pending.as_str(),
                    u64_to_i64(now_ms)
                ],
            )?;
            Ok(CreditRequest {
                id: conn.last_insert_rowid(),
                user_id,
                message,
                status: CreditRequestStatus::Pending,
                created_at_ms: now_ms,
                reviewed_at_ms: None,
                credits_granted: 0,
            })
        })
        .await
    }

    async fn list_credit_requests(
        &self,
        status: Option<CreditRequestStatus>,
    ) -> Result<Vec<CreditRequest>, StoreError> {
        self.with_connection(move |conn| {
            let mut out = Vec::new();
            if let Some(status) = status {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CREDIT_REQUEST_COLUMNS} FROM credit_requests
                     WHERE status = ?1
                     ORDER BY id DESC"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![status.as_str()],
                    credit_request_from_row,
                )?;
                for row in rows {
                    out.push(row?);
                }
            } else {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CREDIT_REQUEST_COLUMNS} FROM credit_requests ORDER BY id DESC"
                ))?;
                let rows = stmt.query_map([], credit_request_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
        .await
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

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut request = tx
                .query_row(
                    &format!(
                        "SELECT {CREDIT_REQUEST_COLUMNS} FROM credit_requests WHERE id = ?1"
                    ),
                    rusqlite::params![id],
                    credit_request_from_row,
                )
                .optional()?
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

            tx.execute(
                "UPDATE credit_requests
                 SET status = ?2, reviewed_at_ms = ?3, credits_granted = ?4
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    request.status.as_str(),
                    u64_to_i64(now_ms),
                    u64_to_i64(request.credits_granted)
                ],
            )?;

            if request.credits_granted > 0 {
                ensure_account(&tx, &request.user_id, now_ms)?;
                tx.execute(
                    "UPDATE accounts
                     SET credits = credits + ?2, updated_at_ms = ?3
                     WHERE user_id = ?1",
                    rusqlite::params![
                        request.user_id,
                        u64_to_i64(request.credits_granted),
                        u64_to_i64(now_ms)
                    ],
                )?;
            }

            tx.commit()?;
            Ok(request)
        })
        .await
    }
}

fn ensure_account(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    now_ms: u64,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT OR IGNORE INTO accounts (user_id, credits, total_generations, created_at_ms, updated_at_ms)
         VALUES (?1, 0, 0, ?2, ?2)",
        rusqlite::params![user_id, u64_to_i64(now_ms)],
    )?;
    Ok(())
}

fn load_or_create_account(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    now_ms: u64,
) -> Result<UserCreditAccount, rusqlite::Error> {
    ensure_account(tx, user_id, now_ms)?;
    tx.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1"),
        rusqlite::params![user_id],
        account_from_row,
    )
}

fn account_from_row(row: &rusqlite::Row<'_>) -> Result<UserCreditAccount, rusqlite::Error> {
    Ok(UserCreditAccount {
        user_id: row.get(0)?,
        credits: i64_to_u64(row.get(1)?),
        total_generations: i64_to_u64(row.get(2)?),
        last_credit_refresh_ms: row.get::<_, Option<i64>>(3)?.map(i64_to_u64),
        email: row.get(4)?,
        display_name: row.get(5)?,
        created_at_ms: i64_to_u64(row.get(6)?),
        updated_at_ms: i64_to_u64(row.get(7)?),
    })
}

fn credit_request_from_row(row: &rusqlite::Row<'_>) -> Result<CreditRequest, rusqlite::Error> {
    let raw_status: String = row.get(3)?;
    let status = raw_status.parse::<CreditRequestStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            err.into(),
        )
    })?;
    Ok(CreditRequest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message: row.get(2)?,
        status,
        created_at_ms: i64_to_u64(row.get(4)?),
        reviewed_at_ms: row.get::<_, Option<i64>>(5)?.map(i64_to_u64),
        credits_granted: i64_to_u64(row.get(6)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            user_id TEXT PRIMARY KEY NOT NULL,
            credits INTEGER NOT NULL DEFAULT 0 CHECK (credits >= 0),
            total_generations INTEGER NOT NULL DEFAULT 0,
            last_credit_refresh_ms INTEGER,
            email TEXT,
            display_name TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            message TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            reviewed_at_ms INTEGER,
            credits_granted INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_credit_requests_status
            ON credit_requests(status, id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests;
