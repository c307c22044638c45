//! Admission control and per-user credit accounting in front of a
//! rate-limited image generation provider.
//!
//! A request flows through [`CreditGate::run`]: one credit is reserved in the
//! [`CreditLedger`], the generation runs through the bounded FIFO
//! [`AdmissionQueue`], and the credit is refunded if the generation fails.

pub mod backend;
pub mod config;
mod error;
pub mod gate;
#[cfg(feature = "server")]
pub mod http;
pub mod ledger;
pub mod observability;
pub mod queue;
pub mod store;
#[cfg(feature = "server")]
pub mod telemetry;

pub use backend::{
    GeneratedImage, GenerationBackend, GenerationError, GenerationRequest, GenerationResponse,
    HttpGenerationBackend,
};
pub use config::{ConfigError, CreditsConfig, ProviderConfig, ServerConfig, StoreConfig};
pub use error::{CreditsError, Result};
pub use gate::{Charged, CreditGate, ErrorKind, GateError, GenerationOutcome};
pub use ledger::{
    Balance, Clock, CreditLedger, CreditSummary, ExemptUserSet, ExemptionPolicy, LedgerError,
    Reservation, StoreFailurePolicy, SystemClock, TopUpOutcome, TopUpPolicy, UNKNOWN_REMAINING,
};
pub use observability::{Observability, ObservabilitySnapshot};
pub use queue::{AdmissionQueue, QueueError, QueueStatus, TaskHandle};
#[cfg(feature = "store-redis")]
pub use store::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{
    AccountIdentity, AccountStore, CreditRequest, CreditRequestStatus, CreditReview, MemoryStore,
    StoreError, UserCreditAccount,
};
