use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::state::StateView, state::SharedContext};

/// Current client state: rooms, activities, display target and trivia.
pub async fn get_state(State(ctx): State<SharedContext>) -> Json<StateView> {
    Json(StateView::capture(&ctx))
}

/// Configure the state snapshot route.
pub fn router() -> Router<SharedContext> {
    Router::<SharedContext>::new().route("/state", get(get_state))
}
