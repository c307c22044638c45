use thiserror::Error;

use crate::backend::GenerationError;
use crate::config::ConfigError;
use crate::gate::GateError;
use crate::ledger::LedgerError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CreditsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CreditsError>;
