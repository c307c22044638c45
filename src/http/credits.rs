use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use super::{
    CreditsHttpState, HttpError, error_response, ledger_error_response, remember_identity,
    require_caller,
};
use crate::ledger::CreditSummary;
use crate::store::CreditRequest;

const MAX_REQUEST_MESSAGE_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
pub(super) struct CreateCreditRequest {
    #[serde(default)]
    message: String,
}

pub(super) async fn get_credits(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
) -> Result<Json<CreditSummary>, HttpError> {
    let caller = require_caller(&headers)?;
    remember_identity(&state, &caller).await;
    let summary = state
        .ledger()
        .balance_with_top_up(&caller.user_id)
        .await
        .map_err(ledger_error_response)?;
    Ok(Json(summary))
}

pub(super) async fn create_credit_request(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Json(body): Json<CreateCreditRequest>,
) -> Result<(StatusCode, Json<CreditRequest>), HttpError> {
    let caller = require_caller(&headers)?;
    let message = body.message.trim();
    if message.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "message must not be empty",
        ));
    }
    if message.chars().count() > MAX_REQUEST_MESSAGE_CHARS {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("message must be at most {MAX_REQUEST_MESSAGE_CHARS} characters"),
        ));
    }

    remember_identity(&state, &caller).await;
    let request = state
        .ledger()
        .create_credit_request(&caller.user_id, message)
        .await
        .map_err(ledger_error_response)?;
    Ok((StatusCode::CREATED, Json(request)))
}
