use serde::Serialize;

use crate::state::channels::ConnectionStatus;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: &'static str,
    /// Real-time channel status.
    pub connection: ConnectionStatus,
}

impl HealthResponse {
    /// Store reachable.
    pub fn ok(connection: ConnectionStatus) -> Self {
        Self {
            status: "ok",
            connection,
        }
    }

    /// Store unreachable; the client only refreshes manually or by polling.
    pub fn degraded(connection: ConnectionStatus) -> Self {
        Self {
            status: "degraded",
            connection,
        }
    }
}
