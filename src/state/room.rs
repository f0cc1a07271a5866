use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dao::models::{ActivityEntity, ActivityKind, OptionEntity, RoomEntity};

/// Settings key holding the countdown duration of a timed activity, in seconds.
pub const TIME_LIMIT_KEY: &str = "time_limit";

/// Runtime view of a voting session.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    /// Primary key of the room.
    pub id: Uuid,
    /// Short numeric join code.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Whether the room accepts participants.
    pub is_active: bool,
    /// Activity the room currently presents.
    pub current_activity_id: Option<Uuid>,
    /// Number of joined participants.
    pub participant_count: u32,
    /// Theme and branding settings.
    pub settings: Map<String, Value>,
    /// Timestamp of the last full response reset.
    pub responses_reset_at: Option<String>,
}

/// Answer choice attached to an activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOption {
    /// Primary key.
    pub id: Uuid,
    /// Owning activity.
    pub activity_id: Uuid,
    /// Label shown to voters.
    pub text: String,
    /// Correct answer of a scored kind.
    pub is_correct: bool,
    /// Votes counted so far.
    pub response_count: u32,
    /// Position within the activity.
    pub order: i32,
}

/// Question of a room together with its ordered options.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    /// Primary key.
    pub id: Uuid,
    /// Owning room.
    pub room_id: Uuid,
    /// Activity type.
    pub kind: ActivityKind,
    /// Question or prompt.
    pub title: String,
    /// Whether it accepts answers.
    pub is_active: bool,
    /// Responses counted so far.
    pub total_responses: u32,
    /// Position within the room.
    pub order: i32,
    /// Kind specific settings.
    pub settings: Map<String, Value>,
    /// Options sorted by their order index.
    pub options: Vec<ActivityOption>,
}

impl Activity {
    /// Build an activity from its record and (possibly unsorted) option records.
    pub fn from_parts(entity: ActivityEntity, options: Vec<OptionEntity>) -> Self {
        let mut activity = Self::from(entity);
        activity.options = options.into_iter().map(ActivityOption::from).collect();
        activity.sort_options();
        activity
    }

    /// Overwrite the scalar columns with an authoritative record, keeping the options.
    pub fn overwrite(&mut self, entity: ActivityEntity) {
        let options = std::mem::take(&mut self.options);
        *self = Self::from(entity);
        self.options = options;
    }

    /// Insert or replace an option, keeping the order index sorted.
    pub fn upsert_option(&mut self, option: ActivityOption) -> bool {
        match self.options.iter_mut().find(|existing| existing.id == option.id) {
            Some(existing) if *existing == option => return false,
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
        self.sort_options();
        true
    }

    /// Remove an option by id, reporting whether it existed.
    pub fn remove_option(&mut self, option_id: Uuid) -> bool {
        let before = self.options.len();
        self.options.retain(|option| option.id != option_id);
        before != self.options.len()
    }

    /// Countdown duration for timed kinds, falling back to `default`.
    pub fn time_limit(&self, default: Duration) -> Duration {
        self.settings
            .get(TIME_LIMIT_KEY)
            .and_then(Value::as_u64)
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Dispatch entry describing how this activity behaves.
    pub fn profile(&self) -> &'static KindProfile {
        profile(self.kind)
    }

    fn sort_options(&mut self) {
        self.options.sort_by_key(|option| option.order);
    }
}

impl From<RoomEntity> for Room {
    fn from(value: RoomEntity) -> Self {
        Self {
            id: value.id,
            code: value.code,
            name: value.name,
            is_active: value.is_active,
            current_activity_id: value.current_activity_id,
            participant_count: value.participant_count,
            settings: value.settings,
            responses_reset_at: value.responses_reset_at,
        }
    }
}

impl From<ActivityEntity> for Activity {
    fn from(value: ActivityEntity) -> Self {
        Self {
            id: value.id,
            room_id: value.room_id,
            kind: value.kind,
            title: value.title,
            is_active: value.is_active,
            total_responses: value.total_responses,
            order: value.order,
            settings: value.settings,
            options: Vec::new(),
        }
    }
}

impl From<OptionEntity> for ActivityOption {
    fn from(value: OptionEntity) -> Self {
        Self {
            id: value.id,
            activity_id: value.activity_id,
            text: value.text,
            is_correct: value.is_correct,
            response_count: value.response_count,
            order: value.order,
        }
    }
}

/// How participants answer an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerShape {
    /// Pick one of the activity options.
    Choice,
    /// Type a short text.
    FreeText,
}

/// Per kind behaviour consulted by creation and vote validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindProfile {
    /// Kind described.
    pub kind: ActivityKind,
    /// Shape of an accepted answer.
    pub answer: AnswerShape,
    /// Exactly one option must be marked correct.
    pub requires_correct: bool,
    /// Runs the countdown state machine when activated.
    pub timed: bool,
    /// Minimum number of options at creation.
    pub min_options: usize,
}

const KIND_PROFILES: [KindProfile; 5] = [
    KindProfile {
        kind: ActivityKind::Poll,
        answer: AnswerShape::Choice,
        requires_correct: false,
        timed: false,
        min_options: 2,
    },
    KindProfile {
        kind: ActivityKind::Trivia,
        answer: AnswerShape::Choice,
        requires_correct: true,
        timed: true,
        min_options: 2,
    },
    KindProfile {
        kind: ActivityKind::Quiz,
        answer: AnswerShape::Choice,
        requires_correct: true,
        timed: false,
        min_options: 2,
    },
    KindProfile {
        kind: ActivityKind::Survey,
        answer: AnswerShape::Choice,
        requires_correct: false,
        timed: false,
        min_options: 2,
    },
    KindProfile {
        kind: ActivityKind::WordCloud,
        answer: AnswerShape::FreeText,
        requires_correct: false,
        timed: false,
        min_options: 0,
    },
];

/// Look up the dispatch entry of `kind`.
pub fn profile(kind: ActivityKind) -> &'static KindProfile {
    KIND_PROFILES
        .iter()
        .find(|profile| profile.kind == kind)
        .unwrap_or(&KIND_PROFILES[0])
}

/// Settings a freshly created activity of `kind` starts with.
pub fn default_settings(kind: ActivityKind, time_limit: Duration) -> Map<String, Value> {
    let mut settings = Map::new();
    if profile(kind).timed {
        settings.insert(TIME_LIMIT_KEY.into(), Value::from(time_limit.as_secs()));
    }
    settings
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn activity(kind: ActivityKind) -> Activity {
        Activity {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            kind,
            title: "Q".into(),
            is_active: false,
            total_responses: 0,
            order: 0,
            settings: Map::new(),
            options: Vec::new(),
        }
    }

    fn option(activity_id: Uuid, order: i32) -> ActivityOption {
        ActivityOption {
            id: Uuid::new_v4(),
            activity_id,
            text: format!("option {order}"),
            is_correct: false,
            response_count: 0,
            order,
        }
    }

    #[test]
    fn every_kind_has_a_profile() {
        for kind in [
            ActivityKind::Poll,
            ActivityKind::Trivia,
            ActivityKind::Quiz,
            ActivityKind::Survey,
            ActivityKind::WordCloud,
        ] {
            assert_eq!(profile(kind).kind, kind);
        }
        assert!(profile(ActivityKind::Trivia).timed);
        assert_eq!(profile(ActivityKind::WordCloud).answer, AnswerShape::FreeText);
    }

    #[test]
    fn trivia_defaults_carry_the_time_limit() {
        let settings = default_settings(ActivityKind::Trivia, Duration::from_secs(30));
        assert_eq!(settings.get(TIME_LIMIT_KEY), Some(&json!(30)));
        assert!(default_settings(ActivityKind::Poll, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn time_limit_falls_back_on_missing_or_zero() {
        let mut trivia = activity(ActivityKind::Trivia);
        let default = Duration::from_secs(30);
        assert_eq!(trivia.time_limit(default), default);

        trivia.settings.insert(TIME_LIMIT_KEY.into(), json!(0));
        assert_eq!(trivia.time_limit(default), default);

        trivia.settings.insert(TIME_LIMIT_KEY.into(), json!(12));
        assert_eq!(trivia.time_limit(default), Duration::from_secs(12));
    }

    #[test]
    fn options_stay_sorted_and_upserts_are_idempotent() {
        let mut poll = activity(ActivityKind::Poll);
        let second = option(poll.id, 2);
        let first = option(poll.id, 1);

        assert!(poll.upsert_option(second.clone()));
        assert!(poll.upsert_option(first.clone()));
        assert!(!poll.upsert_option(first.clone()));
        assert_eq!(poll.options, vec![first.clone(), second]);

        assert!(poll.remove_option(first.id));
        assert!(!poll.remove_option(first.id));
    }
}
