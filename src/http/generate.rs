use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::Instrument as _;

use super::{CreditsHttpState, remember_identity, require_caller};
use crate::backend::{GenerationRequest, GenerationResponse};
use crate::gate::{GateError, GenerationOutcome};

pub(super) async fn generate_images(
    State(state): State<CreditsHttpState>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Response {
    let caller = match require_caller(&headers) {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let span = tracing::info_span!(
        "generate_images",
        user_id = %caller.user_id,
        backend = state.backend.name(),
        status = tracing::field::Empty,
    );

    async move {
        remember_identity(&state, &caller).await;

        if let Err(err) = state.ledger().daily_top_up(&caller.user_id).await {
            tracing::warn!(error = %err, "daily top-up skipped");
        }

        let backend = state.backend.clone();
        let result = state
            .gate
            .run(&caller.user_id, move || async move {
                backend.generate(request).await
            })
            .await;

        let status = match &result {
            Ok(_) => StatusCode::OK,
            Err(GateError::QuotaExhausted) => StatusCode::PAYMENT_REQUIRED,
            Err(GateError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Err(GateError::Ledger(_)) => StatusCode::BAD_REQUEST,
            Err(GateError::Task { .. }) => StatusCode::BAD_GATEWAY,
        };
        tracing::Span::current().record("status", tracing::field::display(status.as_u16()));

        let outcome: GenerationOutcome<GenerationResponse> = result.into();
        (status, Json(outcome)).into_response()
    }
    .instrument(span)
    .await
}
