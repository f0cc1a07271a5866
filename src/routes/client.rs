use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::activity::ActionResponse,
    error::AppError,
    services::{connection_service, room_service, trivia_service},
    state::SharedContext,
};

/// Local client controls: trivia reset, reconnect and manual refresh.
pub fn router() -> Router<SharedContext> {
    Router::new()
        .route("/trivia/reset", post(reset_trivia))
        .route("/connection/reconnect", post(reconnect))
        .route("/sync/refresh", post(refresh))
}

/// Return the local trivia timeline to `waiting`.
pub async fn reset_trivia(State(ctx): State<SharedContext>) -> Json<ActionResponse> {
    trivia_service::reset(&ctx);
    Json(ActionResponse::new("trivia reset"))
}

/// Resubscribe every channel and reload.
pub async fn reconnect(State(ctx): State<SharedContext>) -> Result<Json<ActionResponse>, AppError> {
    if ctx.is_degraded() {
        return Err(AppError::ServiceUnavailable(
            "storage unreachable; real-time disabled".into(),
        ));
    }
    connection_service::reconnect(&ctx).await?;
    Ok(Json(ActionResponse::new("reconnected")))
}

/// Reload the selected room from the store.
pub async fn refresh(State(ctx): State<SharedContext>) -> Result<Json<ActionResponse>, AppError> {
    room_service::refresh(&ctx).await?;
    Ok(Json(ActionResponse::new("state refreshed")))
}
