//! HTTP surface: generation, balances, credit requests and admin CRUD.

mod admin;
mod credits;
mod generate;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use crate::backend::GenerationBackend;
use crate::gate::CreditGate;
use crate::ledger::{CreditLedger, LedgerError};
use crate::observability::ObservabilitySnapshot;
use crate::queue::QueueStatus;
use crate::store::{AccountIdentity, StoreError};

#[derive(Clone)]
pub struct CreditsHttpState {
    gate: CreditGate,
    backend: Arc<dyn GenerationBackend>,
    admin_token: Option<String>,
}

impl CreditsHttpState {
    pub fn new(gate: CreditGate, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            gate,
            backend,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }

    fn ledger(&self) -> &CreditLedger {
        self.gate.ledger()
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    counters: ObservabilitySnapshot,
    queue: QueueStatus,
}

pub fn router(state: CreditsHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/queue/status", get(queue_status))
        .route("/v1/images/generations", post(generate::generate_images))
        .route("/v1/credits", get(credits::get_credits))
        .route("/v1/credit-requests", post(credits::create_credit_request));

    if state.admin_token.is_some() {
        router = router
            .route("/admin/users", get(admin::list_users))
            .route(
                "/admin/users/:user_id",
                put(admin::set_user_credits)
                    .get(admin::get_user)
                    .delete(admin::delete_user),
            )
            .route(
                "/admin/users/:user_id/credits/increment",
                post(admin::increment_user_credits),
            )
            .route("/admin/credit-requests", get(admin::list_credit_requests))
            .route(
                "/admin/credit-requests/:id/review",
                post(admin::review_credit_request),
            );
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<CreditsHttpState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.ledger().observability().snapshot(),
        queue: state.gate.queue().status(),
    })
}

async fn queue_status(State(state): State<CreditsHttpState>) -> Json<QueueStatus> {
    Json(state.gate.queue().status())
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn ledger_error_response(err: LedgerError) -> HttpError {
    match &err {
        LedgerError::InvalidUserId => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
        }
        LedgerError::StoreUnavailable(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            err.to_string(),
        ),
        LedgerError::Store(StoreError::CreditRequestNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        LedgerError::Store(StoreError::AlreadyReviewed { .. }) => {
            error_response(StatusCode::CONFLICT, "already_reviewed", err.to_string())
        }
        LedgerError::Store(StoreError::PendingReview) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
        }
        LedgerError::Store(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        ),
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// The caller as asserted by the upstream authenticating proxy.
#[derive(Debug, Clone)]
struct Caller {
    user_id: String,
    identity: AccountIdentity,
}

fn require_caller(headers: &HeaderMap) -> Result<Caller, HttpError> {
    let Some(user_id) = extract_header(headers, "x-user-id") else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "missing x-user-id header",
        ));
    };
    Ok(Caller {
        user_id,
        identity: AccountIdentity {
            email: extract_header(headers, "x-user-email"),
            display_name: extract_header(headers, "x-user-name"),
        },
    })
}

/// Best effort: identity is informational, so failures are only logged.
async fn remember_identity(state: &CreditsHttpState, caller: &Caller) {
    if let Err(err) = state
        .ledger()
        .record_identity(&caller.user_id, &caller.identity)
        .await
    {
        tracing::warn!(user_id = %caller.user_id, error = %err, "failed to record account identity");
    }
}
