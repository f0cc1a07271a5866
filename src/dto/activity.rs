use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::dao::models::{ActivityKind, ResponseEntity};

/// Payload creating an activity at the end of a room's order.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateActivityRequest {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[validate(length(min = 1, max = 500))]
    pub title: String,
    #[serde(default)]
    #[validate(nested)]
    pub options: Vec<OptionInput>,
    /// Overrides merged over the kind's default settings.
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

/// Answer choice supplied at creation.
#[derive(Debug, Deserialize, Validate)]
pub struct OptionInput {
    #[validate(length(min = 1, max = 200))]
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

/// A participant's answer: an option for choice kinds, a text for free text kinds.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitResponseRequest {
    #[serde(default)]
    pub option_id: Option<Uuid>,
    #[serde(default)]
    #[validate(length(min = 1, max = 60))]
    pub text: Option<String>,
}

/// Stored response returned to the voter.
#[derive(Debug, Serialize)]
pub struct ResponseReceipt {
    pub id: Uuid,
    pub activity_id: Uuid,
    pub option_id: Option<Uuid>,
    pub response_time_ms: u64,
}

impl From<ResponseEntity> for ResponseReceipt {
    fn from(response: ResponseEntity) -> Self {
        Self {
            id: response.id,
            activity_id: response.activity_id,
            option_id: response.option_id,
            response_time_ms: response.response_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionCount {
    pub option_id: Uuid,
    pub response_count: u32,
}

/// Counters recomputed from stored responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSummary {
    pub activity_id: Uuid,
    pub total_responses: u32,
    pub options: Vec<OptionCount>,
}

/// Generic acknowledgement of an action.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub message: String,
}

impl ActionResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
