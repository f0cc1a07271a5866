//! Vote submission guard and counter maintenance.

use std::collections::HashMap;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::{models::ResponseEntity, repository::patch, storage::Filter},
    dto::activity::{CounterSummary, OptionCount, SubmitResponseRequest},
    error::ServiceError,
    services::sync_service,
    state::{
        SharedContext,
        room::{Activity, AnswerShape},
        snapshot::OptimisticEdit,
    },
};

/// Check the answer against the activity's shape.
fn validate_answer(
    activity: &Activity,
    request: &SubmitResponseRequest,
) -> Result<(Option<Uuid>, Option<String>), ServiceError> {
    match activity.profile().answer {
        AnswerShape::Choice => {
            let Some(option_id) = request.option_id else {
                return Err(ServiceError::InvalidInput("an option must be selected".into()));
            };
            if request.text.is_some() {
                return Err(ServiceError::InvalidInput(
                    "choice answers carry no text".into(),
                ));
            }
            if !activity.options.iter().any(|option| option.id == option_id) {
                return Err(ServiceError::InvalidInput(format!(
                    "option {option_id} is not part of activity {}",
                    activity.id
                )));
            }
            Ok((Some(option_id), None))
        }
        AnswerShape::FreeText => {
            if request.option_id.is_some() {
                return Err(ServiceError::InvalidInput(
                    "free text answers take no option".into(),
                ));
            }
            match request.text.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => Ok((None, Some(text.to_string()))),
                _ => Err(ServiceError::InvalidInput("an answer text is required".into())),
            }
        }
    }
}

/// Record one answer of the local participant.
///
/// Order of checks: local ledger, activity state, answer shape, trivia phase,
/// remote existence. Counter increments after the insert are best effort.
pub async fn submit_response(
    ctx: &SharedContext,
    activity_id: Uuid,
    request: SubmitResponseRequest,
) -> Result<ResponseEntity, ServiceError> {
    let Some((room_id, pointer)) = ctx.with_store(|store| {
        store
            .selected_room()
            .map(|room| (room.id, room.current_activity_id))
    }) else {
        return Err(ServiceError::InvalidState("join a room before voting".into()));
    };

    if ctx.with_participant(|profile| profile.has_voted(activity_id)) {
        return Err(ServiceError::Conflict(format!(
            "already answered activity {activity_id}"
        )));
    }

    let activity = ctx
        .with_store(|store| store.activity(activity_id).cloned())
        .filter(|activity| activity.room_id == room_id)
        .ok_or_else(|| ServiceError::NotFound(format!("activity {activity_id}")))?;
    if !activity.is_active && pointer != Some(activity_id) {
        return Err(ServiceError::InvalidState(format!(
            "activity {activity_id} is not live"
        )));
    }
    let (option_id, text) = validate_answer(&activity, &request)?;

    let mut response_time_ms = 0;
    if activity.profile().timed {
        let now = Instant::now();
        let window = ctx.with_trivia(|machine| {
            let state = machine.state();
            let started = state
                .start_time
                .filter(|_| state.activity_id == Some(activity_id));
            (machine.accepts_answers(activity_id), started)
        });
        match window {
            (false, _) => {
                return Err(ServiceError::InvalidState(
                    "answers are closed for this question".into(),
                ));
            }
            (true, Some(start)) => {
                response_time_ms = now.saturating_duration_since(start).as_millis() as u64;
            }
            (true, None) => {}
        }
    }

    let participant_id = ctx.participant_id();
    let repository = ctx.repository();
    if repository
        .find_response(activity_id, participant_id)
        .await?
        .is_some()
    {
        ctx.with_participant_mut(|profile| profile.record_vote(activity_id, room_id));
        return Err(ServiceError::Conflict(format!(
            "already answered activity {activity_id}"
        )));
    }

    let stored = repository
        .insert_response(&ResponseEntity {
            id: Uuid::new_v4(),
            room_id,
            activity_id,
            option_id,
            text,
            participant_id,
            response_time_ms,
            created_at: None,
        })
        .await?;

    ctx.with_participant_mut(|profile| profile.record_vote(activity_id, room_id));
    let changed = ctx.with_store_mut(|store| {
        store.apply_optimistic(OptimisticEdit::IncrementVote {
            activity_id,
            option_id,
        })
    });
    if changed {
        sync_service::refresh_views(ctx);
    }

    increment_counters(ctx, activity_id, option_id).await;
    info!(%activity_id, response_id = %stored.id, "response recorded");
    Ok(stored)
}

/// Bump the option and activity counters; each failure is logged and left
/// for [`recompute_counters`] to repair.
async fn increment_counters(ctx: &SharedContext, activity_id: Uuid, option_id: Option<Uuid>) {
    let repository = ctx.repository();

    if let Some(option_id) = option_id {
        let result = async {
            let Some(option) = repository.find_option(option_id).await? else {
                return Ok(());
            };
            repository
                .update_options(
                    Filter::by_id(option_id),
                    patch([("response_count", Value::from(option.response_count + 1))]),
                )
                .await
                .map(|_| ())
        }
        .await;
        if let Err(err) = result {
            warn!(%option_id, error = %err, "failed to increment option counter");
        }
    }

    let result = async {
        let Some(activity) = repository.find_activity(activity_id).await? else {
            return Ok(());
        };
        repository
            .update_activities(
                Filter::by_id(activity_id),
                patch([("total_responses", Value::from(activity.total_responses + 1))]),
            )
            .await
            .map(|_| ())
    }
    .await;
    if let Err(err) = result {
        warn!(%activity_id, error = %err, "failed to increment activity counter");
    }
}

/// Recount an activity's counters from its stored responses.
pub async fn recompute_counters(
    ctx: &SharedContext,
    activity_id: Uuid,
) -> Result<CounterSummary, ServiceError> {
    let repository = ctx.repository();
    if repository.find_activity(activity_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("activity {activity_id}")));
    }

    let responses = repository.list_responses(activity_id).await?;
    let mut tally: HashMap<Uuid, u32> = HashMap::new();
    for option_id in responses.iter().filter_map(|response| response.option_id) {
        *tally.entry(option_id).or_default() += 1;
    }

    let mut options = Vec::new();
    for option in repository.list_options(activity_id).await? {
        let count = tally.get(&option.id).copied().unwrap_or(0);
        if option.response_count != count {
            repository
                .update_options(
                    Filter::by_id(option.id),
                    patch([("response_count", Value::from(count))]),
                )
                .await?;
        }
        options.push(OptionCount {
            option_id: option.id,
            response_count: count,
        });
    }

    let total_responses = responses.len() as u32;
    repository
        .update_activities(
            Filter::by_id(activity_id),
            patch([("total_responses", Value::from(total_responses))]),
        )
        .await?;

    info!(%activity_id, total_responses, "counters recomputed");
    Ok(CounterSummary {
        activity_id,
        total_responses,
        options,
    })
}
