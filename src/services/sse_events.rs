use serde::Serialize;
use tracing::warn;

use crate::{
    dto::{
        sse::{ConnectionChanged, ServerEvent, SystemStatus},
        state::{StateView, TriviaView},
    },
    state::{ClientContext, channels::ConnectionStatus, display::DisplayTarget},
};

const EVENT_STATE: &str = "state";
const EVENT_CONNECTION: &str = "connection";
const EVENT_DISPLAY: &str = "display";
const EVENT_TRIVIA: &str = "trivia";
const EVENT_SYSTEM_STATUS: &str = "system_status";

/// Broadcast a full snapshot of the reconciled state.
pub fn broadcast_state(ctx: &ClientContext) {
    send_event(ctx, EVENT_STATE, &StateView::capture(ctx));
}

/// Broadcast a connection status change.
pub fn broadcast_connection(ctx: &ClientContext, status: ConnectionStatus) {
    send_event(ctx, EVENT_CONNECTION, &ConnectionChanged { status });
}

/// Broadcast the activity the display should switch to.
pub fn broadcast_display(ctx: &ClientContext, target: DisplayTarget) {
    send_event(ctx, EVENT_DISPLAY, &target);
}

/// Broadcast the trivia timeline, once per tick while it runs.
pub fn broadcast_trivia(ctx: &ClientContext, view: &TriviaView) {
    send_event(ctx, EVENT_TRIVIA, view);
}

/// Broadcast that the store became unreachable or reachable again.
pub fn broadcast_system_status(ctx: &ClientContext, degraded: bool) {
    send_event(ctx, EVENT_SYSTEM_STATUS, &SystemStatus { degraded });
}

fn send_event(ctx: &ClientContext, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => ctx.sse().broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize SSE payload"),
    }
}
