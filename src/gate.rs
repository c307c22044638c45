//! Charges one credit per generation: reserve, run through the admission
//! queue, refund if the work failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::GenerationError;
use crate::ledger::{CreditLedger, LedgerError, Reservation, UNKNOWN_REMAINING};
use crate::queue::{AdmissionQueue, TaskHandle};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no credits remaining")]
    QuotaExhausted,
    #[error("credit check unavailable: {0}")]
    StoreUnavailable(#[source] LedgerError),
    #[error("credit ledger rejected the request: {0}")]
    Ledger(#[source] LedgerError),
    #[error("generation failed: {source}")]
    Task {
        #[source]
        source: GenerationError,
        /// Balance after the refund attempt.
        credits_remaining: i64,
    },
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QuotaExhausted => ErrorKind::QuotaExhausted,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Ledger(_) => ErrorKind::InvalidRequest,
            Self::Task { .. } => ErrorKind::TaskFailure,
        }
    }
}

impl From<LedgerError> for GateError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::StoreUnavailable(_) => Self::StoreUnavailable(err),
            other => Self::Ledger(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaExhausted,
    StoreUnavailable,
    TaskFailure,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExhausted => "quota_exhausted",
            Self::StoreUnavailable => "store_unavailable",
            Self::TaskFailure => "task_failure",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

/// A successful, charged generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Charged<T> {
    pub output: T,
    pub credits_remaining: i64,
}

/// Caller-facing result of [`CreditGate::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome<T> {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    pub credits_remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> From<Result<Charged<T>, GateError>> for GenerationOutcome<T> {
    fn from(result: Result<Charged<T>, GateError>) -> Self {
        match result {
            Ok(charged) => Self {
                granted: true,
                result: Some(charged.output),
                credits_remaining: charged.credits_remaining,
                error: None,
                message: None,
            },
            Err(err) => {
                let (granted, credits_remaining) = match &err {
                    GateError::QuotaExhausted | GateError::Ledger(_) => (false, 0),
                    GateError::StoreUnavailable(_) => (false, UNKNOWN_REMAINING),
                    GateError::Task {
                        credits_remaining, ..
                    } => (true, *credits_remaining),
                };
                Self {
                    granted,
                    result: None,
                    credits_remaining,
                    error: Some(err.kind()),
                    message: Some(err.to_string()),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditGate {
    ledger: Arc<CreditLedger>,
    queue: Arc<AdmissionQueue>,
    timeout: Option<Duration>,
}

impl CreditGate {
    pub fn new(ledger: Arc<CreditLedger>, queue: Arc<AdmissionQueue>) -> Self {
        Self {
            ledger,
            queue,
            timeout: None,
        }
    }

    /// Bounds how long a task may run once it holds a queue slot. Queue wait
    /// time does not count.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Reserves a credit for `user_id`, runs `task` through the admission
    /// queue, and refunds the credit once if the task fails.
    ///
    /// Reservation and settlement run on their own task, so dropping the
    /// returned future never strands a charged credit: once reserved, the
    /// work still runs and a failure is still refunded.
    pub async fn run<F, Fut, T>(&self, user_id: &str, task: F) -> Result<Charged<T>, GateError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, GenerationError>> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.ledger.clone();
        let queue = self.queue.clone();
        let timeout = self.timeout;
        let user = user_id.to_string();
        let gated =
            tokio::spawn(async move { admit(&ledger, &queue, timeout, &user, task).await });

        match gated.await {
            Ok(result) => result,
            Err(err) => {
                self.ledger.observability().record_refund_failure();
                tracing::error!(
                    user_id,
                    error = %err,
                    "credit gate task did not complete; any reservation it held was not refunded"
                );
                Err(GateError::Task {
                    source: GenerationError::Interrupted(err.to_string()),
                    credits_remaining: UNKNOWN_REMAINING,
                })
            }
        }
    }
}

async fn admit<F, Fut, T>(
    ledger: &CreditLedger,
    queue: &AdmissionQueue,
    timeout: Option<Duration>,
    user_id: &str,
    task: F,
) -> Result<Charged<T>, GateError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, GenerationError>> + Send + 'static,
    T: Send + 'static,
{
    let reservation = ledger.reserve_one(user_id).await?;
    if !reservation.granted {
        tracing::info!(user_id, "generation rejected: quota exhausted");
        return Err(GateError::QuotaExhausted);
    }

    let handle = queue.submit(move || async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, task())
                .await
                .unwrap_or_else(|_| Err(GenerationError::Timeout(limit))),
            None => task().await,
        }
    });
    settle(ledger, user_id, reservation, handle).await
}

async fn settle<T>(
    ledger: &CreditLedger,
    user_id: &str,
    reservation: Reservation,
    handle: TaskHandle<Result<T, GenerationError>>,
) -> Result<Charged<T>, GateError> {
    let observability = ledger.observability();
    let failure = match handle.await {
        Ok(Ok(output)) => {
            observability.record_task_succeeded();
            return Ok(Charged {
                output,
                credits_remaining: reservation.remaining,
            });
        }
        Ok(Err(err)) => err,
        Err(err) => GenerationError::Interrupted(err.to_string()),
    };

    observability.record_task_failed();
    tracing::warn!(user_id, error = %failure, "generation failed; refunding credit");
    let credits_remaining = refund(ledger, user_id, reservation).await;
    Err(GateError::Task {
        source: failure,
        credits_remaining,
    })
}

/// Best effort. Returns the balance the caller should see afterwards.
async fn refund(ledger: &CreditLedger, user_id: &str, reservation: Reservation) -> i64 {
    if reservation.is_unbacked() {
        return UNKNOWN_REMAINING;
    }
    match ledger.refund_one(user_id).await {
        Ok(()) => reservation.remaining.saturating_add(1),
        Err(err) => {
            ledger.observability().record_refund_failure();
            tracing::error!(user_id, error = %err, "credit refund failed");
            reservation.remaining
        }
    }
}
