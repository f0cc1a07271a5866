use axum::Router;

use crate::state::SharedContext;

/// Activity lifecycle and voting routes.
pub mod activities;
/// Local client controls.
pub mod client;
/// Health check route.
pub mod health;
/// Room session and room scoped routes.
pub mod rooms;
/// Server-Sent Events stream.
pub mod sse;
/// State snapshot route.
pub mod state;

/// Compose all route trees and wire in the client context.
pub fn router(ctx: SharedContext) -> Router<()> {
    health::router()
        .merge(sse::router())
        .merge(state::router())
        .merge(rooms::router())
        .merge(activities::router())
        .merge(client::router())
        .with_state(ctx)
}
