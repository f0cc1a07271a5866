use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::dto::validation::validate_room_code;

/// Join a room by its code.
#[derive(Debug, Deserialize, Validate)]
pub struct JoinRoomRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub code: String,
}

/// Create a room; its code is generated.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoomRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
}

/// New order of a room's activities.
#[derive(Debug, Deserialize, Validate)]
pub struct ReorderRequest {
    #[validate(length(min = 1))]
    pub ordered_ids: Vec<Uuid>,
}
