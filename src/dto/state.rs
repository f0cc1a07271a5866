use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    dao::models::ActivityKind,
    state::{
        ClientContext,
        channels::ConnectionStatus,
        display::DisplayTarget,
        room::{Activity, ActivityOption, Room},
        trivia::{TriviaMachine, TriviaPhase},
    },
};

/// Room as shown in listings and as the selected room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub is_active: bool,
    pub current_activity_id: Option<Uuid>,
    pub participant_count: u32,
    pub settings: Map<String, Value>,
    pub responses_reset_at: Option<String>,
}

impl From<Room> for RoomSummary {
    fn from(room: Room) -> Self {
        Self {
            id: room.id,
            code: room.code,
            name: room.name,
            is_active: room.is_active,
            current_activity_id: room.current_activity_id,
            participant_count: room.participant_count,
            settings: room.settings,
            responses_reset_at: room.responses_reset_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionView {
    pub id: Uuid,
    pub text: String,
    pub is_correct: bool,
    pub response_count: u32,
    pub order: i32,
}

impl From<ActivityOption> for OptionView {
    fn from(option: ActivityOption) -> Self {
        Self {
            id: option.id,
            text: option.text,
            is_correct: option.is_correct,
            response_count: option.response_count,
            order: option.order,
        }
    }
}

/// Activity of the selected room with its options.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityView {
    pub id: Uuid,
    pub room_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub title: String,
    pub is_active: bool,
    pub total_responses: u32,
    pub order: i32,
    pub settings: Map<String, Value>,
    pub options: Vec<OptionView>,
    /// This participant already answered.
    pub voted: bool,
}

impl ActivityView {
    /// View of `activity` for a participant who did or did not vote.
    pub fn new(activity: Activity, voted: bool) -> Self {
        Self {
            id: activity.id,
            room_id: activity.room_id,
            kind: activity.kind,
            title: activity.title,
            is_active: activity.is_active,
            total_responses: activity.total_responses,
            order: activity.order,
            settings: activity.settings,
            options: activity.options.into_iter().map(OptionView::from).collect(),
            voted,
        }
    }
}

/// Local trivia timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TriviaView {
    pub activity_id: Option<Uuid>,
    pub phase: TriviaPhase,
    pub time_remaining_ms: u64,
    pub correct_answer_revealed: bool,
}

impl TriviaView {
    /// Evaluate the machine at `now`.
    pub fn capture(machine: &TriviaMachine, now: Instant) -> Self {
        let state = machine.state();
        Self {
            activity_id: state.activity_id,
            phase: state.phase,
            time_remaining_ms: machine.time_remaining(now).as_millis() as u64,
            correct_answer_revealed: state.correct_answer_revealed,
        }
    }
}

/// Everything a UI needs to render this client.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub revision: u64,
    pub connection: ConnectionStatus,
    pub degraded: bool,
    pub participant_id: Uuid,
    pub rooms: Vec<RoomSummary>,
    pub selected_room: Option<RoomSummary>,
    pub activities: Vec<ActivityView>,
    pub display: DisplayTarget,
    pub trivia: TriviaView,
}

impl StateView {
    /// Snapshot the context. Locks are taken one at a time.
    pub fn capture(ctx: &ClientContext) -> Self {
        let (revision, rooms, selected_room, activities) = ctx.with_store(|store| {
            (
                store.revision(),
                store.rooms().cloned().collect::<Vec<_>>(),
                store.selected_room().cloned(),
                store.activities().cloned().collect::<Vec<_>>(),
            )
        });
        let activities = ctx.with_participant(|profile| {
            activities
                .into_iter()
                .map(|activity| {
                    let voted = profile.has_voted(activity.id);
                    ActivityView::new(activity, voted)
                })
                .collect()
        });
        let trivia = ctx.with_trivia(|machine| TriviaView::capture(machine, Instant::now()));

        Self {
            revision,
            connection: ctx.connection_status(),
            degraded: ctx.is_degraded(),
            participant_id: ctx.participant_id(),
            rooms: rooms.into_iter().map(RoomSummary::from).collect(),
            selected_room: selected_room.map(RoomSummary::from),
            activities,
            display: ctx.display(),
            trivia,
        }
    }
}
