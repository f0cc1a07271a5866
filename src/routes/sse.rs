use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedContext};

/// Stream state, connection and trivia events to the UI.
///
/// Every new subscriber first receives a handshake and the current state.
pub async fn state_stream(
    State(ctx): State<SharedContext>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    // Subscribe before capturing so no broadcast falls between the two.
    let receiver = sse_service::subscribe(&ctx);
    let initial = sse_service::initial_events(&ctx);
    info!("new state SSE connection");
    sse_service::to_sse_stream(initial, receiver)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedContext> {
    Router::<SharedContext>::new().route("/sse/state", get(state_stream))
}
