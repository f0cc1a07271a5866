use tracing::warn;

use crate::{dto::health::HealthResponse, state::ClientContext};

/// Probe the store and report it together with the real-time status.
///
/// The probe result only feeds the log; the degraded flag itself is owned by
/// the supervisor.
pub async fn health_status(ctx: &ClientContext) -> HealthResponse {
    if let Err(err) = ctx.repository().health_check().await {
        warn!(error = %err, "storage health check failed");
    }

    let connection = ctx.connection_status();
    if ctx.is_degraded() {
        HealthResponse::degraded(connection)
    } else {
        HealthResponse::ok(connection)
    }
}
