use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dao::storage::Row;

/// Kind of question an activity asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Opinion poll, no correct answer.
    Poll,
    /// Timed question with a correct answer and a countdown.
    Trivia,
    /// Untimed question with a correct answer.
    Quiz,
    /// Multi-question style survey item.
    Survey,
    /// Free text answers aggregated into a cloud.
    WordCloud,
}

/// Room record persisted by the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomEntity {
    /// Primary key of the room.
    pub id: Uuid,
    /// Short numeric code participants type to join.
    pub code: String,
    /// Display name of the session.
    pub name: String,
    /// Whether the room accepts participants.
    #[serde(default)]
    pub is_active: bool,
    /// Activity currently presented, if any.
    #[serde(default)]
    pub current_activity_id: Option<Uuid>,
    /// Number of participants that joined.
    #[serde(default)]
    pub participant_count: u32,
    /// Theme and branding settings.
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// RFC 3339 timestamp of the last full response reset.
    #[serde(default)]
    pub responses_reset_at: Option<String>,
}

/// Activity record persisted by the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntity {
    /// Primary key of the activity.
    pub id: Uuid,
    /// Owning room.
    pub room_id: Uuid,
    /// Kind of question.
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Question text.
    pub title: String,
    /// Whether the activity is live.
    #[serde(default)]
    pub is_active: bool,
    /// Denormalized response counter.
    #[serde(default)]
    pub total_responses: u32,
    /// Position within the room.
    #[serde(default)]
    pub order: i32,
    /// Kind specific settings (time limit, ...).
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Answer choice record persisted by the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionEntity {
    /// Primary key of the option.
    pub id: Uuid,
    /// Owning activity.
    pub activity_id: Uuid,
    /// Choice label.
    pub text: String,
    /// Whether this is the correct answer (trivia and quiz).
    #[serde(default)]
    pub is_correct: bool,
    /// Denormalized vote counter.
    #[serde(default)]
    pub response_count: u32,
    /// Position within the activity.
    #[serde(default)]
    pub order: i32,
}

/// Vote record persisted by the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEntity {
    /// Primary key of the response.
    pub id: Uuid,
    /// Room the vote was cast in.
    pub room_id: Uuid,
    /// Activity voted on.
    pub activity_id: Uuid,
    /// Selected option for choice activities.
    #[serde(default)]
    pub option_id: Option<Uuid>,
    /// Submitted text for free text activities.
    #[serde(default)]
    pub text: Option<String>,
    /// Locally generated participant identifier.
    pub participant_id: Uuid,
    /// Time between countdown start and the vote.
    #[serde(default)]
    pub response_time_ms: u64,
    /// RFC 3339 creation timestamp, filled in by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Decode a raw row into a typed entity.
pub fn decode<T: DeserializeOwned>(row: &Row) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(row.clone()))
}

/// Encode a typed entity into a raw row.
pub fn encode<T: Serialize>(entity: &T) -> serde_json::Result<Row> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// Extract the `id` column of a row, if present and well formed.
pub fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}
