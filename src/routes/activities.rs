use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::activity::{ActionResponse, CounterSummary, ResponseReceipt, SubmitResponseRequest},
    error::AppError,
    services::{lifecycle_service, vote_service},
    state::SharedContext,
};

/// Activity-scoped lifecycle and voting endpoints.
pub fn router() -> Router<SharedContext> {
    Router::new()
        .route("/activities/{id}", delete(delete_activity))
        .route("/activities/{id}/end", post(end_activity))
        .route("/activities/{id}/responses", post(submit_response))
        .route("/activities/{id}/recount", post(recount))
}

/// End a live activity.
pub async fn end_activity(
    State(ctx): State<SharedContext>,
    Path(activity_id): Path<Uuid>,
) -> Result<Json<ActionResponse>, AppError> {
    lifecycle_service::end_activity(&ctx, activity_id).await?;
    Ok(Json(ActionResponse::new("activity ended")))
}

/// Delete an activity, clearing the room pointer when it was live.
pub async fn delete_activity(
    State(ctx): State<SharedContext>,
    Path(activity_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    lifecycle_service::delete_activity(&ctx, activity_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Submit the local participant's answer.
pub async fn submit_response(
    State(ctx): State<SharedContext>,
    Path(activity_id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<SubmitResponseRequest>>,
) -> Result<(StatusCode, Json<ResponseReceipt>), AppError> {
    let response = vote_service::submit_response(&ctx, activity_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ResponseReceipt::from(response))))
}

/// Recount an activity's counters from its stored responses.
pub async fn recount(
    State(ctx): State<SharedContext>,
    Path(activity_id): Path<Uuid>,
) -> Result<Json<CounterSummary>, AppError> {
    Ok(Json(
        vote_service::recompute_counters(&ctx, activity_id).await?,
    ))
}
