use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    CreditsHttpState, HttpError, error_response, extract_bearer, extract_header,
    ledger_error_response,
};
use crate::store::{CreditRequest, CreditRequestStatus, CreditReview, UserCreditAccount};

#[derive(Debug, Deserialize)]
pub(super) struct SetCreditsBody {
    credits: u64,
}

#[derive(Debug, Deserialize)]
pub(super) struct IncrementCreditsBody {
    delta: i64,
}

#[derive(Debug, Serialize)]
pub(super) struct CreditsResponse {
    user_id: String,
    credits: u64,
}

#[derive(Debug, Serialize)]
pub(super) struct DeletedResponse {
    user_id: String,
    deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListCreditRequestsQuery {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ReviewBody {
    status: CreditRequestStatus,
    #[serde(default)]
    credits: u64,
}

fn ensure_admin(state: &CreditsHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };

    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

pub(super) async fn list_users(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserCreditAccount>>, HttpError> {
    ensure_admin(&state, &headers)?;
    let accounts = state
        .ledger()
        .list_accounts()
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(accounts))
}

pub(super) async fn get_user(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserCreditAccount>, HttpError> {
    ensure_admin(&state, &headers)?;
    let account = state
        .ledger()
        .account(&user_id)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(account))
}

pub(super) async fn set_user_credits(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<SetCreditsBody>,
) -> Result<Json<UserCreditAccount>, HttpError> {
    ensure_admin(&state, &headers)?;
    let ledger = state.ledger();
    ledger
        .set_balance(&user_id, body.credits)
        .await
        .map_err(ledger_error_response)?;
    let account = ledger
        .account(&user_id)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(account))
}

pub(super) async fn increment_user_credits(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<IncrementCreditsBody>,
) -> Result<Json<CreditsResponse>, HttpError> {
    ensure_admin(&state, &headers)?;
    let credits = state
        .ledger()
        .increment_balance(&user_id, body.delta)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(CreditsResponse { user_id, credits }))
}

pub(super) async fn delete_user(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<DeletedResponse>, HttpError> {
    ensure_admin(&state, &headers)?;
    let deleted = state
        .ledger()
        .delete_account(&user_id)
        .await
        .map_err(ledger_error_response)?;
    if !deleted {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("account not found: {user_id}"),
        ));
    }
    Ok(Json(DeletedResponse { user_id, deleted }))
}

pub(super) async fn list_credit_requests(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Query(query): Query<ListCreditRequestsQuery>,
) -> Result<Json<Vec<CreditRequest>>, HttpError> {
    ensure_admin(&state, &headers)?;
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(raw.parse::<CreditRequestStatus>().map_err(|err| {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", err)
        })?),
    };
    let requests = state
        .ledger()
        .list_credit_requests(status)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(requests))
}

pub(super) async fn review_credit_request(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<CreditRequest>, HttpError> {
    ensure_admin(&state, &headers)?;
    let review = match body.status {
        CreditRequestStatus::Approved => CreditReview::approve(body.credits),
        CreditRequestStatus::Denied => CreditReview::deny(),
        CreditRequestStatus::Pending => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "status must be approved or denied",
            ));
        }
    };
    let reviewed = state
        .ledger()
        .review_credit_request(id, review)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(reviewed))
}
