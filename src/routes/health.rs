use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::health::HealthResponse, services::health_service, state::SharedContext};

/// Return the store health and the real-time connection status.
pub async fn healthcheck(State(ctx): State<SharedContext>) -> Json<HealthResponse> {
    Json(health_service::health_status(&ctx).await)
}

/// Configure the health routes subtree.
pub fn router() -> Router<SharedContext> {
    Router::<SharedContext>::new().route("/healthcheck", get(healthcheck))
}
