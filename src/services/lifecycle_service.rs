//! Activity lifecycle: start, end, delete, reorder, create and room resets.
//!
//! Every operation is a sequence of independent store writes. Optimistic
//! edits are applied before the first write; when a step fails the local
//! state is reloaded and the error carries the journal of steps that did
//! reach the store. Nothing is retried automatically.

use std::{collections::HashSet, future::Future};

use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{ActivityEntity, OptionEntity},
        repository::patch,
        storage::{Filter, StorageResult},
    },
    dto::activity::CreateActivityRequest,
    error::ServiceError,
    services::sync_service,
    state::{
        SharedContext,
        room::{Activity, AnswerShape, default_settings, profile},
        snapshot::OptimisticEdit,
    },
};

/// Steps of one lifecycle operation that reached the store.
struct Journal {
    operation: &'static str,
    completed: Vec<String>,
}

impl Journal {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            completed: Vec::new(),
        }
    }

    /// Run one write and record it.
    async fn step<T>(
        &mut self,
        step: &str,
        write: impl Future<Output = StorageResult<T>>,
    ) -> Result<T, ServiceError> {
        match write.await {
            Ok(value) => {
                debug!(operation = self.operation, step, "step applied");
                self.completed.push(step.to_string());
                Ok(value)
            }
            Err(err) => Err(self.failure(step, err.into())),
        }
    }

    /// Run an update that must match at least one row.
    async fn step_matching<T>(
        &mut self,
        step: &str,
        missing: impl FnOnce() -> String,
        write: impl Future<Output = StorageResult<Vec<T>>>,
    ) -> Result<Vec<T>, ServiceError> {
        match write.await {
            Ok(rows) if rows.is_empty() => {
                Err(self.failure(step, ServiceError::NotFound(missing())))
            }
            Ok(rows) => {
                debug!(operation = self.operation, step, "step applied");
                self.completed.push(step.to_string());
                Ok(rows)
            }
            Err(err) => Err(self.failure(step, err.into())),
        }
    }

    /// Wrap `err` with the journal; a failure before any write stays bare.
    fn failure(&mut self, step: &str, err: ServiceError) -> ServiceError {
        if self.completed.is_empty() {
            return err;
        }
        ServiceError::PartialLifecycle {
            operation: self.operation,
            completed: std::mem::take(&mut self.completed),
            failed: step.to_string(),
            source: Box::new(err),
        }
    }
}

/// Discard optimistic edits by reloading, then hand the error back.
async fn rollback(ctx: &SharedContext, err: ServiceError) -> ServiceError {
    warn!(error = %err, "lifecycle operation failed; reloading");
    if let Err(reload_err) = sync_service::reload(ctx).await {
        warn!(error = %reload_err, "reload after failed lifecycle operation failed");
    }
    err
}

/// Room owning `activity_id`, from the snapshot or the store.
async fn owning_room(ctx: &SharedContext, activity_id: Uuid) -> Result<Uuid, ServiceError> {
    if let Some(room_id) = ctx.with_store(|store| store.activity(activity_id).map(|a| a.room_id)) {
        return Ok(room_id);
    }
    ctx.repository()
        .find_activity(activity_id)
        .await?
        .map(|activity| activity.room_id)
        .ok_or_else(|| ServiceError::NotFound(format!("activity {activity_id}")))
}

fn apply_edits(ctx: &SharedContext, edits: Vec<OptimisticEdit>) {
    let changed = ctx.with_store_mut(|store| {
        edits
            .into_iter()
            .fold(false, |changed, edit| store.apply_optimistic(edit) || changed)
    });
    if changed {
        sync_service::refresh_views(ctx);
    }
}

fn in_room(room_id: Uuid) -> Filter {
    Filter::all().eq("room_id", room_id.to_string())
}

/// Make `activity_id` the single live activity of `room_id`.
pub async fn start_activity(
    ctx: &SharedContext,
    room_id: Uuid,
    activity_id: Uuid,
) -> Result<(), ServiceError> {
    let _gate = ctx.lifecycle_gate().lock().await;

    let owner = owning_room(ctx, activity_id).await?;
    if owner != room_id {
        return Err(ServiceError::InvalidInput(format!(
            "activity {activity_id} does not belong to room {room_id}"
        )));
    }

    apply_edits(
        ctx,
        vec![
            OptimisticEdit::DeactivateAllInRoom { room_id },
            OptimisticEdit::SetActive {
                activity_id,
                active: true,
            },
            OptimisticEdit::SetCurrentActivity {
                room_id,
                activity_id: Some(activity_id),
            },
        ],
    );

    match start_steps(ctx, room_id, activity_id).await {
        Ok(()) => {
            info!(%room_id, %activity_id, "activity started");
            Ok(())
        }
        Err(err) => Err(rollback(ctx, err).await),
    }
}

async fn start_steps(ctx: &SharedContext, room_id: Uuid, activity_id: Uuid) -> Result<(), ServiceError> {
    let repository = ctx.repository();
    let mut journal = Journal::new("start_activity");

    journal
        .step(
            "deactivate_all",
            repository.update_activities(
                in_room(room_id).eq("is_active", true),
                patch([("is_active", Value::Bool(false))]),
            ),
        )
        .await?;
    journal
        .step_matching(
            "activate",
            || format!("activity {activity_id}"),
            repository.update_activities(
                Filter::by_id(activity_id).eq("room_id", room_id.to_string()),
                patch([("is_active", Value::Bool(true))]),
            ),
        )
        .await?;
    journal
        .step_matching(
            "set_pointer",
            || format!("room {room_id}"),
            repository.update_rooms(
                Filter::by_id(room_id),
                patch([("current_activity_id", Value::from(activity_id.to_string()))]),
            ),
        )
        .await?;

    let room = journal
        .step("verify", repository.find_room(room_id))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("room {room_id}")))?;
    if room.current_activity_id != Some(activity_id) {
        return Err(ServiceError::Conflict(format!(
            "room {room_id} was switched to {:?} concurrently",
            room.current_activity_id
        )));
    }
    Ok(())
}

/// Stop `activity_id`; the room pointer is cleared only if it still targets it.
pub async fn end_activity(ctx: &SharedContext, activity_id: Uuid) -> Result<(), ServiceError> {
    let _gate = ctx.lifecycle_gate().lock().await;
    let room_id = owning_room(ctx, activity_id).await?;

    let mut edits = vec![OptimisticEdit::SetActive {
        activity_id,
        active: false,
    }];
    let pointed = ctx.with_store(|store| {
        store
            .room(room_id)
            .is_some_and(|room| room.current_activity_id == Some(activity_id))
    });
    if pointed {
        edits.push(OptimisticEdit::SetCurrentActivity {
            room_id,
            activity_id: None,
        });
    }
    apply_edits(ctx, edits);

    let repository = ctx.repository();
    let mut journal = Journal::new("end_activity");
    let result = async {
        journal
            .step_matching(
                "deactivate",
                || format!("activity {activity_id}"),
                repository.update_activities(
                    Filter::by_id(activity_id),
                    patch([("is_active", Value::Bool(false))]),
                ),
            )
            .await?;
        journal
            .step(
                "clear_pointer",
                repository.update_rooms(
                    Filter::by_id(room_id).eq("current_activity_id", activity_id.to_string()),
                    patch([("current_activity_id", Value::Null)]),
                ),
            )
            .await?;
        Ok::<_, ServiceError>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(%room_id, %activity_id, "activity ended");
            Ok(())
        }
        Err(err) => Err(rollback(ctx, err).await),
    }
}

/// Delete an activity, shielding it from resurrection until the delete lands.
pub async fn delete_activity(ctx: &SharedContext, activity_id: Uuid) -> Result<(), ServiceError> {
    let _gate = ctx.lifecycle_gate().lock().await;
    let repository = ctx.repository();

    let local = ctx.with_store(|store| {
        store.activity(activity_id).map(|activity| {
            let pointed = store
                .room(activity.room_id)
                .is_some_and(|room| room.current_activity_id == Some(activity_id));
            (activity.room_id, activity.is_active, pointed)
        })
    });
    let (room_id, active, pointed) = match local {
        Some(found) => found,
        None => {
            let entity = repository
                .find_activity(activity_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("activity {activity_id}")))?;
            let pointed = repository
                .find_room(entity.room_id)
                .await?
                .is_some_and(|room| room.current_activity_id == Some(activity_id));
            (entity.room_id, entity.is_active, pointed)
        }
    };
    let live = active || pointed;

    ctx.with_store_mut(|store| store.mark_pending_deletion(activity_id, Instant::now()));
    let mut edits = vec![OptimisticEdit::RemoveActivity { activity_id }];
    // The store only clears a pointer that still names this activity.
    if pointed {
        edits.push(OptimisticEdit::SetCurrentActivity {
            room_id,
            activity_id: None,
        });
    }
    apply_edits(ctx, edits);

    let mut journal = Journal::new("delete_activity");
    let result = async {
        if live {
            journal
                .step(
                    "clear_pointer",
                    repository.update_rooms(
                        Filter::by_id(room_id).eq("current_activity_id", activity_id.to_string()),
                        patch([("current_activity_id", Value::Null)]),
                    ),
                )
                .await?;
        }
        journal
            .step("delete", repository.delete_activity(activity_id))
            .await?;
        if journal
            .step("verify", repository.find_activity(activity_id))
            .await?
            .is_some()
        {
            return Err(ServiceError::DeleteNotApplied(activity_id));
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            ctx.with_participant_mut(|profile| profile.forget_vote(activity_id));
            sync_service::prune_ledger(ctx);
            info!(%room_id, %activity_id, "activity deleted");
            Ok(())
        }
        Err(err) => {
            ctx.with_store_mut(|store| store.clear_pending_deletion(activity_id));
            Err(rollback(ctx, err).await)
        }
    }
}

/// Persist a new order; one write per activity.
pub async fn reorder_activities(
    ctx: &SharedContext,
    room_id: Uuid,
    ordered_ids: Vec<Uuid>,
) -> Result<(), ServiceError> {
    let unique: HashSet<&Uuid> = ordered_ids.iter().collect();
    if unique.len() != ordered_ids.len() {
        return Err(ServiceError::InvalidInput(
            "ordered ids contain duplicates".into(),
        ));
    }

    let _gate = ctx.lifecycle_gate().lock().await;
    apply_edits(
        ctx,
        vec![OptimisticEdit::Reorder {
            ordered_ids: ordered_ids.clone(),
        }],
    );

    let repository = ctx.repository();
    let mut journal = Journal::new("reorder_activities");
    let result = async {
        for (index, activity_id) in ordered_ids.iter().enumerate() {
            journal
                .step_matching(
                    &format!("order #{index}"),
                    || format!("activity {activity_id} in room {room_id}"),
                    repository.update_activities(
                        Filter::by_id(activity_id).eq("room_id", room_id.to_string()),
                        patch([("order", Value::from(index))]),
                    ),
                )
                .await?;
        }
        Ok::<_, ServiceError>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(%room_id, count = ordered_ids.len(), "activities reordered");
            Ok(())
        }
        Err(err) => Err(rollback(ctx, err).await),
    }
}

/// Validate a creation request against the kind's dispatch entry.
fn validate_creation(input: &CreateActivityRequest) -> Result<(), ServiceError> {
    let kind = profile(input.kind);
    match kind.answer {
        AnswerShape::FreeText if !input.options.is_empty() => {
            return Err(ServiceError::InvalidInput(format!(
                "{:?} activities take no options",
                input.kind
            )));
        }
        AnswerShape::Choice if input.options.len() < kind.min_options => {
            return Err(ServiceError::InvalidInput(format!(
                "{:?} activities need at least {} options",
                input.kind, kind.min_options
            )));
        }
        _ => {}
    }
    let correct = input.options.iter().filter(|option| option.is_correct).count();
    if kind.requires_correct && correct != 1 {
        return Err(ServiceError::InvalidInput(format!(
            "{:?} activities need exactly one correct option, got {correct}",
            input.kind
        )));
    }
    Ok(())
}

/// Append a new inactive activity with its options to the room.
pub async fn create_activity(
    ctx: &SharedContext,
    room_id: Uuid,
    input: CreateActivityRequest,
) -> Result<Activity, ServiceError> {
    validate_creation(&input)?;
    let _gate = ctx.lifecycle_gate().lock().await;
    let repository = ctx.repository();

    if repository.find_room(room_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("room {room_id}")));
    }
    let order = repository
        .list_activities(room_id)
        .await?
        .iter()
        .map(|activity| activity.order + 1)
        .max()
        .unwrap_or(0);

    let mut settings = default_settings(input.kind, ctx.config().trivia_default_time_limit);
    settings.extend(input.settings.unwrap_or_default());

    let mut journal = Journal::new("create_activity");
    let result = async {
        let entity = journal
            .step(
                "insert_activity",
                repository.insert_activity(&ActivityEntity {
                    id: Uuid::new_v4(),
                    room_id,
                    kind: input.kind,
                    title: input.title,
                    is_active: false,
                    total_responses: 0,
                    order,
                    settings,
                }),
            )
            .await?;

        let mut options = Vec::with_capacity(input.options.len());
        for (index, option) in input.options.into_iter().enumerate() {
            let stored = journal
                .step(
                    &format!("insert_option #{index}"),
                    repository.insert_option(&OptionEntity {
                        id: Uuid::new_v4(),
                        activity_id: entity.id,
                        text: option.text,
                        is_correct: option.is_correct,
                        response_count: 0,
                        order: index as i32,
                    }),
                )
                .await?;
            options.push(stored);
        }
        Ok::<_, ServiceError>(Activity::from_parts(entity, options))
    }
    .await;

    match result {
        Ok(activity) => {
            apply_edits(ctx, vec![OptimisticEdit::InsertActivity(activity.clone())]);
            info!(%room_id, activity_id = %activity.id, kind = ?activity.kind, "activity created");
            Ok(activity)
        }
        Err(err) => Err(rollback(ctx, err).await),
    }
}

/// Wipe every response of the room and return it to a neutral state.
pub async fn reset_room_responses(ctx: &SharedContext, room_id: Uuid) -> Result<(), ServiceError> {
    let _gate = ctx.lifecycle_gate().lock().await;
    let repository = ctx.repository();

    let activities = repository.list_activities(room_id).await?;
    let mut journal = Journal::new("reset_room_responses");
    let result = async {
        journal
            .step("delete_responses", repository.delete_room_responses(room_id))
            .await?;
        for activity in &activities {
            journal
                .step(
                    &format!("zero_options {}", activity.id),
                    repository.update_options(
                        Filter::all().eq("activity_id", activity.id.to_string()),
                        patch([("response_count", Value::from(0))]),
                    ),
                )
                .await?;
        }
        journal
            .step(
                "zero_activities",
                repository.update_activities(
                    in_room(room_id),
                    patch([
                        ("total_responses", Value::from(0)),
                        ("is_active", Value::Bool(false)),
                    ]),
                ),
            )
            .await?;

        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| ServiceError::InvalidState(err.to_string()))?;
        journal
            .step_matching(
                "clear_room",
                || format!("room {room_id}"),
                repository.update_rooms(
                    Filter::by_id(room_id),
                    patch([
                        ("current_activity_id", Value::Null),
                        ("responses_reset_at", Value::from(stamp)),
                    ]),
                ),
            )
            .await?;
        Ok::<_, ServiceError>(())
    }
    .await;

    match result {
        Ok(()) => {
            let cleared = ctx.with_participant_mut(|profile| profile.clear_room(room_id) > 0);
            info!(%room_id, cleared, "room responses reset");
            // Counters and flags changed on many rows at once.
            sync_service::reload(ctx).await
        }
        Err(err) => Err(rollback(ctx, err).await),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        dao::{
            data_store::{
                ChangeEvent, ChangeType,
                memory::{MemoryBackend, Mutation, Operation},
            },
            models::ActivityKind,
            storage::Table,
        },
        dto::activity::{OptionInput, SubmitResponseRequest},
        services::{
            room_service,
            sync_service::SyncMessage,
            test_support::{context, detached_client, seed_activity, seed_room, settle},
            vote_service,
        },
        state::display::DisplayTarget,
    };

    async fn joined_room_with_polls(
        count: i32,
    ) -> (SharedContext, MemoryBackend, Uuid, Vec<Uuid>) {
        let (ctx, backend) = context();
        let room = seed_room(&backend, "4821").await;
        let mut ids = Vec::new();
        for order in 0..count {
            let activity = seed_activity(
                &backend,
                room.id,
                ActivityKind::Poll,
                order,
                &[("Yes", false), ("No", false)],
            )
            .await;
            ids.push(activity.id);
        }
        room_service::join_room(&ctx, "4821").await.unwrap();
        settle(&ctx).await;
        (ctx, backend, room.id, ids)
    }

    fn room_pointer(ctx: &SharedContext, room_id: Uuid) -> Option<Uuid> {
        ctx.with_store(|store| store.room(room_id).and_then(|room| room.current_activity_id))
    }

    fn pointer_clears(mutations: &[Mutation]) -> usize {
        mutations
            .iter()
            .filter(|m| {
                m.operation == Operation::Update
                    && m.table == Table::Rooms
                    && m.row
                        .as_ref()
                        .is_some_and(|row| row.get("current_activity_id") == Some(&Value::Null))
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_quick_end_converges_to_idle() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(1).await;
        let a1 = ids[0];

        start_activity(&ctx, room_id, a1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        end_activity(&ctx, a1).await.unwrap();
        settle(&ctx).await;

        assert_eq!(ctx.display(), DisplayTarget::Idle);
        assert_eq!(room_pointer(&ctx, room_id), None);
        assert_eq!(ctx.with_store(|store| store.activity(a1).map(|a| a.is_active)), Some(false));

        let stored = backend.rows(Table::Rooms);
        assert_eq!(stored[0]["current_activity_id"], Value::Null);
    }

    #[tokio::test]
    async fn starting_another_activity_keeps_one_live() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;

        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        start_activity(&ctx, room_id, ids[1]).await.unwrap();
        settle(&ctx).await;

        let active: Vec<Uuid> = ctx.with_store(|store| {
            store
                .activities()
                .filter(|activity| activity.is_active)
                .map(|activity| activity.id)
                .collect()
        });
        assert_eq!(active, vec![ids[1]]);
        assert_eq!(room_pointer(&ctx, room_id), Some(ids[1]));
        assert_eq!(
            ctx.display(),
            DisplayTarget::Activity {
                activity_id: ids[1],
                stale_flag: false
            }
        );
        let stored_active = backend
            .rows(Table::Activities)
            .iter()
            .filter(|row| row["is_active"] == json!(true))
            .count();
        assert_eq!(stored_active, 1);
    }

    #[tokio::test]
    async fn failed_activation_reports_the_journal_and_rolls_back() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;
        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        settle(&ctx).await;

        // Both activity writes land, the room pointer write fails.
        backend.fail_next(Operation::Update, Table::Rooms, 1);
        let err = start_activity(&ctx, room_id, ids[1]).await.unwrap_err();
        settle(&ctx).await;

        match err {
            ServiceError::PartialLifecycle {
                completed, failed, ..
            } => {
                assert_eq!(completed, vec!["deactivate_all", "activate"]);
                assert_eq!(failed, "set_pointer");
            }
            other => panic!("unexpected {other:?}"),
        }
        // Local state reflects the store again: the pointer still targets the first activity.
        assert_eq!(room_pointer(&ctx, room_id), Some(ids[0]));
        assert_eq!(
            ctx.with_store(|store| store.activity(ids[1]).map(|a| a.is_active)),
            Some(true)
        );
    }

    #[tokio::test]
    async fn first_step_failure_is_returned_bare() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(1).await;
        backend.fail_next(Operation::Update, Table::Activities, 1);

        let err = start_activity(&ctx, room_id, ids[0]).await.unwrap_err();

        assert!(matches!(err, ServiceError::Transient(_)));
        assert_eq!(
            ctx.with_store(|store| store.activity(ids[0]).map(|a| a.is_active)),
            Some(false)
        );
    }

    #[tokio::test]
    async fn end_leaves_a_foreign_pointer_alone() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;
        start_activity(&ctx, room_id, ids[1]).await.unwrap();

        end_activity(&ctx, ids[0]).await.unwrap();
        settle(&ctx).await;

        assert_eq!(room_pointer(&ctx, room_id), Some(ids[1]));
        assert_eq!(
            backend.rows(Table::Rooms)[0]["current_activity_id"],
            json!(ids[1].to_string())
        );
    }

    #[tokio::test]
    async fn deleting_the_live_activity_clears_the_pointer_once() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;
        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        settle(&ctx).await;
        let before = pointer_clears(&backend.mutations());

        delete_activity(&ctx, ids[0]).await.unwrap();
        settle(&ctx).await;

        assert_eq!(pointer_clears(&backend.mutations()) - before, 1);
        assert_eq!(room_pointer(&ctx, room_id), None);
        assert!(ctx.with_store(|store| store.activity(ids[0]).is_none()));
        assert_eq!(ctx.display(), DisplayTarget::Idle);
        assert_eq!(backend.rows(Table::ActivityOptions).len(), 2);
    }

    #[tokio::test]
    async fn deleting_an_active_activity_keeps_a_pointer_to_another() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;
        // Transient window: the old activity is still flagged, the room already moved on.
        ctx.repository()
            .update_activities(Filter::by_id(ids[0]), patch([("is_active", Value::Bool(true))]))
            .await
            .unwrap();
        ctx.repository()
            .update_rooms(
                Filter::by_id(room_id),
                patch([("current_activity_id", Value::from(ids[1].to_string()))]),
            )
            .await
            .unwrap();
        settle(&ctx).await;

        delete_activity(&ctx, ids[0]).await.unwrap();
        settle(&ctx).await;

        assert_eq!(room_pointer(&ctx, room_id), Some(ids[1]));
        assert_eq!(
            backend.rows(Table::Rooms)[0]["current_activity_id"],
            json!(ids[1].to_string())
        );
        assert_eq!(
            ctx.display(),
            DisplayTarget::Activity {
                activity_id: ids[1],
                stale_flag: true
            }
        );
    }

    /// Let the feed forwarders run, then take what they queued without merging it.
    async fn queued_events(ctx: &SharedContext) -> Vec<ChangeEvent> {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        let mut events = Vec::new();
        while let Some(message) = ctx.try_next_sync() {
            if let SyncMessage::Event { event, .. } = message {
                events.push(event);
            }
        }
        events
    }

    async fn replay<'a>(ctx: &SharedContext, events: impl IntoIterator<Item = &'a ChangeEvent>) {
        for event in events {
            sync_service::apply_message(
                ctx,
                SyncMessage::Event {
                    channel: "replay".into(),
                    event: event.clone(),
                },
            )
            .await;
        }
    }

    fn active_ids(ctx: &SharedContext) -> Vec<Uuid> {
        ctx.with_store(|store| {
            store
                .activities()
                .filter(|activity| activity.is_active)
                .map(|activity| activity.id)
                .collect()
        })
    }

    #[tokio::test]
    async fn other_clients_converge_whatever_the_cross_table_order() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(2).await;
        let rooms_first = detached_client(&backend);
        let rooms_last = detached_client(&backend);
        room_service::join_room(&rooms_first, "4821").await.unwrap();
        room_service::join_room(&rooms_last, "4821").await.unwrap();

        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        start_activity(&ctx, room_id, ids[1]).await.unwrap();
        let events = queued_events(&ctx).await;
        let (room_events, activity_events): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|event| event.table == Table::Rooms.name());
        assert!(!room_events.is_empty());
        assert!(!activity_events.is_empty());

        replay(&rooms_first, room_events.iter().chain(&activity_events)).await;
        replay(&rooms_last, activity_events.iter().chain(&room_events)).await;

        for observer in [&rooms_first, &rooms_last] {
            assert_eq!(active_ids(observer), vec![ids[1]]);
            assert_eq!(room_pointer(observer, room_id), Some(ids[1]));
        }
    }

    #[tokio::test]
    async fn deleted_activity_is_not_resurrected_by_late_events() {
        let (ctx, backend, _room_id, ids) = joined_room_with_polls(1).await;
        let stale = backend
            .rows(Table::Activities)
            .into_iter()
            .next()
            .unwrap();

        delete_activity(&ctx, ids[0]).await.unwrap();
        // A late update processed before the delete event itself.
        sync_service::apply_message(
            &ctx,
            SyncMessage::Event {
                channel: "room".into(),
                event: ChangeEvent {
                    table: Table::Activities.name().into(),
                    change: ChangeType::Update,
                    new: Some(stale),
                    old: None,
                },
            },
        )
        .await;
        assert!(ctx.with_store(|store| store.activity(ids[0]).is_none()));
        settle(&ctx).await;

        assert!(ctx.with_store(|store| store.activity(ids[0]).is_none()));
    }

    #[tokio::test]
    async fn unapplied_delete_is_reported_and_restored() {
        let (ctx, backend, _room_id, ids) = joined_room_with_polls(1).await;
        backend.ignore_deletes(Table::Activities);

        let err = delete_activity(&ctx, ids[0]).await.unwrap_err();
        settle(&ctx).await;

        match err {
            ServiceError::DeleteNotApplied(id) => assert_eq!(id, ids[0]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ctx.with_store(|store| store.activity(ids[0]).is_some()));
    }

    #[tokio::test]
    async fn deleting_prunes_the_vote_ledger() {
        let (ctx, _backend, room_id, ids) = joined_room_with_polls(1).await;
        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        let option_id = ctx.with_store(|store| store.activity(ids[0]).unwrap().options[0].id);
        vote_service::submit_response(
            &ctx,
            ids[0],
            SubmitResponseRequest {
                option_id: Some(option_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(ctx.with_participant(|p| p.has_voted(ids[0])));

        delete_activity(&ctx, ids[0]).await.unwrap();

        assert!(!ctx.with_participant(|p| p.has_voted(ids[0])));
    }

    #[tokio::test]
    async fn reorder_reports_how_many_writes_landed() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(3).await;
        let reversed: Vec<Uuid> = ids.iter().rev().copied().collect();

        reorder_activities(&ctx, room_id, reversed.clone()).await.unwrap();
        settle(&ctx).await;
        assert_eq!(ctx.with_store(|store| store.activity_ids()), reversed);

        let foreign = Uuid::new_v4();
        let err = reorder_activities(&ctx, room_id, vec![ids[0], foreign])
            .await
            .unwrap_err();
        match err {
            ServiceError::PartialLifecycle {
                completed, failed, ..
            } => {
                assert_eq!(completed, vec!["order #0"]);
                assert_eq!(failed, "order #1");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            reorder_activities(&ctx, room_id, vec![ids[0], ids[0]]).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    fn trivia_request(options: Vec<(&str, bool)>) -> CreateActivityRequest {
        CreateActivityRequest {
            kind: ActivityKind::Trivia,
            title: "Capital of France?".into(),
            options: options
                .into_iter()
                .map(|(text, is_correct)| OptionInput {
                    text: text.into(),
                    is_correct,
                })
                .collect(),
            settings: None,
        }
    }

    #[tokio::test]
    async fn create_appends_with_kind_defaults() {
        let (ctx, backend, room_id, _ids) = joined_room_with_polls(2).await;

        let created = create_activity(&ctx, room_id, trivia_request(vec![("Paris", true), ("Lyon", false)]))
            .await
            .unwrap();
        settle(&ctx).await;

        assert_eq!(created.order, 2);
        assert_eq!(created.settings["time_limit"], json!(30));
        assert_eq!(created.options.len(), 2);
        assert_eq!(backend.rows(Table::ActivityOptions).len(), 6);
        assert_eq!(
            ctx.with_store(|store| store.activity(created.id).map(|a| a.options.len())),
            Some(2)
        );
    }

    #[tokio::test]
    async fn create_rejects_inputs_the_kind_does_not_allow() {
        let (ctx, _backend, room_id, _ids) = joined_room_with_polls(0).await;

        let no_correct = create_activity(&ctx, room_id, trivia_request(vec![("A", false), ("B", false)])).await;
        assert!(matches!(no_correct, Err(ServiceError::InvalidInput(_))));

        let too_few = create_activity(&ctx, room_id, trivia_request(vec![("A", true)])).await;
        assert!(matches!(too_few, Err(ServiceError::InvalidInput(_))));

        let cloud_with_options = create_activity(
            &ctx,
            room_id,
            CreateActivityRequest {
                kind: ActivityKind::WordCloud,
                title: "One word".into(),
                options: vec![OptionInput {
                    text: "x".into(),
                    is_correct: false,
                }],
                settings: None,
            },
        )
        .await;
        assert!(matches!(cloud_with_options, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn reset_wipes_responses_and_counters() {
        let (ctx, backend, room_id, ids) = joined_room_with_polls(1).await;
        start_activity(&ctx, room_id, ids[0]).await.unwrap();
        let option_id = ctx.with_store(|store| store.activity(ids[0]).unwrap().options[0].id);
        vote_service::submit_response(
            &ctx,
            ids[0],
            SubmitResponseRequest {
                option_id: Some(option_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        reset_room_responses(&ctx, room_id).await.unwrap();
        settle(&ctx).await;

        assert!(backend.rows(Table::ParticipantResponses).is_empty());
        let activity = ctx.with_store(|store| store.activity(ids[0]).cloned()).unwrap();
        assert_eq!(activity.total_responses, 0);
        assert!(!activity.is_active);
        assert!(activity.options.iter().all(|o| o.response_count == 0));
        assert_eq!(room_pointer(&ctx, room_id), None);
        assert!(!ctx.with_participant(|p| p.has_voted(ids[0])));
        assert!(backend.rows(Table::Rooms)[0]["responses_reset_at"].is_string());
    }
}
