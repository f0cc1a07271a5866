use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        activity::{ActionResponse, CreateActivityRequest},
        room::{CreateRoomRequest, JoinRoomRequest, ReorderRequest},
        state::{ActivityView, RoomSummary},
    },
    error::AppError,
    services::{lifecycle_service, room_service},
    state::SharedContext,
};

/// Room sessions and room-scoped lifecycle operations.
pub fn router() -> Router<SharedContext> {
    Router::new()
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/join", post(join_room))
        .route("/rooms/leave", post(leave_room))
        .route("/rooms/{id}/activities", post(create_activity))
        .route("/rooms/{id}/order", put(reorder_activities))
        .route("/rooms/{id}/reset", post(reset_room))
        .route(
            "/rooms/{room_id}/activities/{activity_id}/start",
            post(start_activity),
        )
}

/// List every room known to the store.
pub async fn list_rooms(
    State(ctx): State<SharedContext>,
) -> Result<Json<Vec<RoomSummary>>, AppError> {
    let rooms = room_service::list_rooms(&ctx).await?;
    Ok(Json(rooms.into_iter().map(RoomSummary::from).collect()))
}

/// Create a room under a generated join code.
pub async fn create_room(
    State(ctx): State<SharedContext>,
    Valid(Json(payload)): Valid<Json<CreateRoomRequest>>,
) -> Result<(StatusCode, Json<RoomSummary>), AppError> {
    let room = room_service::create_room(&ctx, payload.name.trim()).await?;
    Ok((StatusCode::CREATED, Json(RoomSummary::from(room))))
}

/// Join a room by code, replacing the current session.
pub async fn join_room(
    State(ctx): State<SharedContext>,
    Valid(Json(payload)): Valid<Json<JoinRoomRequest>>,
) -> Result<Json<RoomSummary>, AppError> {
    let room = room_service::join_room(&ctx, &payload.code).await?;
    Ok(Json(RoomSummary::from(room)))
}

/// Leave the current room.
pub async fn leave_room(State(ctx): State<SharedContext>) -> Json<ActionResponse> {
    room_service::leave_room(&ctx);
    Json(ActionResponse::new("room left"))
}

/// Append an activity to the room.
pub async fn create_activity(
    State(ctx): State<SharedContext>,
    Path(room_id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<CreateActivityRequest>>,
) -> Result<(StatusCode, Json<ActivityView>), AppError> {
    let activity = lifecycle_service::create_activity(&ctx, room_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ActivityView::new(activity, false))))
}

/// Persist a new activity order.
pub async fn reorder_activities(
    State(ctx): State<SharedContext>,
    Path(room_id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<ReorderRequest>>,
) -> Result<Json<ActionResponse>, AppError> {
    lifecycle_service::reorder_activities(&ctx, room_id, payload.ordered_ids).await?;
    Ok(Json(ActionResponse::new("activities reordered")))
}

/// Wipe the room's responses and counters.
pub async fn reset_room(
    State(ctx): State<SharedContext>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<ActionResponse>, AppError> {
    lifecycle_service::reset_room_responses(&ctx, room_id).await?;
    Ok(Json(ActionResponse::new("room responses reset")))
}

/// Make an activity the room's single live activity.
pub async fn start_activity(
    State(ctx): State<SharedContext>,
    Path((room_id, activity_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ActionResponse>, AppError> {
    lifecycle_service::start_activity(&ctx, room_id, activity_id).await?;
    Ok(Json(ActionResponse::new("activity started")))
}
