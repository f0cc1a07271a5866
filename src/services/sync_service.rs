//! Sync loop: merges change events into the snapshot and runs full reloads.
//!
//! Every feed event, lost channel notification and reload request funnels
//! through one inbox. Messages and reloads requested from outside the loop
//! hold the sync gate, so a merge never lands between the reads of a reload
//! and the install of its snapshot.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    dao::{
        data_store::{ChangeEvent, ChangeType},
        models::{ResponseEntity, decode},
        storage::Table,
    },
    error::ServiceError,
    services::{connection_service, sse_events, trivia_service},
    state::{
        ClientContext, SharedContext,
        display,
        room::{Activity, Room},
        snapshot::MergeOutcome,
    },
};

/// Work item of the sync loop.
#[derive(Debug)]
pub enum SyncMessage {
    /// Event delivered on a channel.
    Event {
        /// Channel that delivered the event.
        channel: String,
        /// The event itself.
        event: ChangeEvent,
    },
    /// The feed reported the subscription `generation` of a channel broken or closed.
    ChannelLost {
        /// Channel name.
        channel: String,
        /// Subscription generation the forwarder belonged to.
        generation: u64,
        /// Why the forwarder stopped.
        reason: String,
    },
    /// Discard local state in favour of a full reload.
    Resynchronize,
}

/// Consume the inbox for the life of the process.
pub async fn run(ctx: SharedContext) {
    let Some(mut inbox) = ctx.take_sync_inbox() else {
        warn!("sync loop already running");
        return;
    };
    info!("sync loop started");
    while let Some(message) = inbox.recv().await {
        apply_message(&ctx, message).await;
    }
}

/// Process every message already queued, without waiting for new ones.
pub async fn drain(ctx: &SharedContext) -> usize {
    let mut processed = 0;
    while let Some(message) = ctx.try_next_sync() {
        apply_message(ctx, message).await;
        processed += 1;
    }
    processed
}

/// Handle one message.
pub async fn apply_message(ctx: &SharedContext, message: SyncMessage) {
    let _gate = ctx.sync_gate().lock().await;
    match message {
        SyncMessage::Event { channel, event } => handle_event(ctx, &channel, event).await,
        SyncMessage::ChannelLost {
            channel,
            generation,
            reason,
        } => connection_service::handle_channel_lost(ctx, &channel, generation, reason),
        SyncMessage::Resynchronize => {
            if let Err(err) = reload_locked(ctx).await {
                warn!(error = %err, "resynchronization failed");
            }
        }
    }
}

async fn handle_event(ctx: &SharedContext, channel: &str, event: ChangeEvent) {
    if event.table == Table::ParticipantResponses.name() {
        sync_ledger(ctx, &event);
    }

    let outcome = ctx.with_store_mut(|store| store.merge(&event, Instant::now()));
    match outcome {
        MergeOutcome::Applied => refresh_views(ctx),
        MergeOutcome::Unchanged => debug!(channel, table = %event.table, "event already merged"),
        MergeOutcome::Ignored(reason) => {
            debug!(channel, table = %event.table, reason, "ignoring event")
        }
        MergeOutcome::UnknownParent { activity_id } => {
            match ctx.repository().find_activity(activity_id).await {
                Ok(Some(parent))
                    if ctx.with_store(|store| store.selected_room_id()) == Some(parent.room_id) =>
                {
                    debug!(channel, %activity_id, "option for an unseen activity; reloading");
                    if let Err(err) = reload_locked(ctx).await {
                        warn!(error = %err, "reload after unknown parent failed");
                    }
                }
                Ok(_) => debug!(channel, %activity_id, "option of another room"),
                Err(err) => warn!(channel, %activity_id, error = %err, "parent lookup failed"),
            }
        }
        MergeOutcome::NeedsReload(reason) => {
            warn!(channel, reason, "unmergeable event; reloading");
            if let Err(err) = reload_locked(ctx).await {
                warn!(error = %err, "reload after unmergeable event failed");
            }
        }
    }
}

/// Keep the vote ledger in line with this participant's stored responses.
fn sync_ledger(ctx: &ClientContext, event: &ChangeEvent) {
    let Some(row) = event.record() else {
        return;
    };
    let Ok(response) = decode::<ResponseEntity>(row) else {
        debug!("response event without a full row");
        return;
    };
    if response.participant_id != ctx.participant_id() {
        return;
    }
    match event.change {
        ChangeType::Insert | ChangeType::Update => ctx.with_participant_mut(|profile| {
            profile.record_vote(response.activity_id, response.room_id)
        }),
        ChangeType::Delete => {
            ctx.with_participant_mut(|profile| profile.forget_vote(response.activity_id))
        }
    };
}

/// Replace local state with the store's: room list, then the selected room.
///
/// Ids with a delete in flight are skipped. The vote ledger is pruned of
/// activities that no longer exist. Waits for the message being merged, and
/// events arriving meanwhile are merged over the new snapshot afterwards.
pub async fn reload(ctx: &SharedContext) -> Result<(), ServiceError> {
    let _gate = ctx.sync_gate().lock().await;
    reload_locked(ctx).await
}

/// Reload with the sync gate already held.
async fn reload_locked(ctx: &SharedContext) -> Result<(), ServiceError> {
    let repository = ctx.repository();

    let rooms = repository.list_rooms().await?;
    ctx.with_store_mut(|store| store.replace_rooms(rooms.into_iter().map(Room::from).collect()));

    let Some(room_id) = ctx.with_store(|store| store.selected_room_id()) else {
        refresh_views(ctx);
        return Ok(());
    };

    let Some(room) = repository.find_room(room_id).await? else {
        warn!(%room_id, "selected room disappeared");
        ctx.with_store_mut(|store| store.clear_selection());
        refresh_views(ctx);
        return Ok(());
    };

    let mut activities = Vec::new();
    for entity in repository.list_activities(room_id).await? {
        let options = repository.list_options(entity.id).await?;
        activities.push(Activity::from_parts(entity, options));
    }

    let installed = ctx.with_store_mut(|store| {
        store.replace_room_snapshot(Room::from(room), activities, Instant::now())
    });
    if installed {
        prune_ledger(ctx);
        debug!(%room_id, "room reloaded");
    }
    refresh_views(ctx);
    Ok(())
}

/// Drop ledger entries of the selected room whose activity is gone.
pub fn prune_ledger(ctx: &ClientContext) {
    let Some((room_id, present)) = ctx.with_store(|store| {
        store
            .selected_room_id()
            .map(|room_id| (room_id, store.activity_ids()))
    }) else {
        return;
    };
    ctx.with_participant_mut(|profile| profile.prune(room_id, &present) > 0);
}

/// Recompute derived views after the snapshot changed and notify subscribers.
pub fn refresh_views(ctx: &SharedContext) {
    let target = ctx.with_store(|store| display::resolve(store.selected_room(), store.activities()));
    if ctx.publish_display(target) {
        info!(activity = ?target.activity_id(), "display target changed");
        sse_events::broadcast_display(ctx, target);
    }

    trivia_service::sync_with_store(ctx);
    sse_events::broadcast_state(ctx);
}
