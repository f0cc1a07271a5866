//! Drives the local trivia timeline from store changes and a one second tick.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dto::state::TriviaView,
    services::sse_events,
    state::{
        ClientContext, SharedContext,
        snapshot::RoomStore,
        trivia::{TriviaEvent, TriviaMachine, TriviaPhase},
    },
};

const TICK: Duration = Duration::from_secs(1);

/// Live timed activity of the selected room: the room pointer first, then any active one.
fn live_trivia(store: &RoomStore, default_limit: Duration) -> Option<(Uuid, Duration)> {
    let room = store.selected_room()?;
    let pointed = room
        .current_activity_id
        .and_then(|id| store.activity(id))
        .filter(|activity| activity.is_active);
    pointed
        .or_else(|| store.activities().find(|activity| activity.is_active))
        .filter(|activity| activity.profile().timed)
        .map(|activity| (activity.id, activity.time_limit(default_limit)))
}

fn apply(machine: &mut TriviaMachine, event: TriviaEvent, now: Instant) {
    if let Err(err) = machine.handle(event, now) {
        debug!(error = %err, "trivia signal ignored");
    }
}

/// Feed the machine with what the snapshot says is live, and with room resets.
pub fn sync_with_store(ctx: &SharedContext) {
    let now = Instant::now();
    let default_limit = ctx.config().trivia_default_time_limit;
    let (room, live) = ctx.with_store(|store| {
        (
            store
                .selected_room()
                .map(|room| (room.id, room.responses_reset_at.clone())),
            live_trivia(store, default_limit),
        )
    });

    let reset_room = observe_reset_marker(ctx, room);

    let (restarted, phase_changed) = ctx.with_trivia_mut(|machine| {
        let epoch = machine.epoch();
        let phase = machine.phase();

        if reset_room.is_some() {
            apply(machine, TriviaEvent::Reset, now);
        }
        match (machine.live_activity(), live) {
            (Some(current), Some((next, _))) if current == next => {}
            (current, next) => {
                if let Some(activity_id) = current {
                    apply(machine, TriviaEvent::Deactivated { activity_id }, now);
                }
                if let Some((activity_id, duration)) = next {
                    apply(
                        machine,
                        TriviaEvent::Activated {
                            activity_id,
                            duration,
                        },
                        now,
                    );
                }
            }
        }
        machine.advance(now);
        (machine.epoch() != epoch, machine.phase() != phase)
    });

    if let Some(room_id) = reset_room {
        let cleared = ctx.with_participant_mut(|profile| profile.clear_room(room_id) > 0);
        info!(%room_id, cleared, "room responses were reset");
    }
    if restarted {
        spawn_driver(ctx);
    }
    if phase_changed || restarted {
        broadcast(ctx, now);
    }
}

/// Remember the selected room's reset stamp; returns the room when it moved.
fn observe_reset_marker(ctx: &ClientContext, room: Option<(Uuid, Option<String>)>) -> Option<Uuid> {
    let previous = ctx.replace_reset_marker(room.clone());
    match (previous, room) {
        (Some((before_room, before)), Some((room_id, Some(stamp))))
            if before_room == room_id && before.as_deref() != Some(stamp.as_str()) =>
        {
            Some(room_id)
        }
        _ => None,
    }
}

fn spawn_driver(ctx: &SharedContext) {
    let epoch = ctx.with_trivia(|machine| machine.epoch());
    let task = tokio::spawn(drive(ctx.clone(), epoch));
    ctx.replace_trivia_driver(Some(task));
}

/// Tick once per second until the timeline of `epoch` completes or is replaced.
async fn drive(ctx: SharedContext, epoch: u64) {
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let step = ctx.with_trivia_mut(|machine| {
            if machine.epoch() != epoch {
                return None;
            }
            let moved = machine.advance(now);
            Some((moved, machine.phase(), TriviaView::capture(machine, now)))
        });
        let Some((moved, phase, view)) = step else {
            debug!(epoch, "trivia driver superseded");
            return;
        };

        sse_events::broadcast_trivia(&ctx, &view);
        if moved {
            info!(?phase, "trivia phase changed");
            sse_events::broadcast_state(&ctx);
        }
        if matches!(phase, TriviaPhase::Waiting | TriviaPhase::Completed) {
            return;
        }
    }
}

fn broadcast(ctx: &ClientContext, now: Instant) {
    let view = ctx.with_trivia(|machine| TriviaView::capture(machine, now));
    sse_events::broadcast_trivia(ctx, &view);
}

/// Stop the timer driver and return to `waiting`.
pub fn cancel(ctx: &ClientContext) {
    ctx.replace_trivia_driver(None);
    let now = Instant::now();
    let changed = ctx.with_trivia_mut(|machine| machine.handle(TriviaEvent::Reset, now));
    if matches!(changed, Ok(true)) {
        debug!("trivia timeline cancelled");
        broadcast(ctx, now);
    }
}

/// Explicit reset requested by the UI.
///
/// An activity that is still live restarts on the next store change, not
/// immediately.
pub fn reset(ctx: &ClientContext) {
    cancel(ctx);
    sse_events::broadcast_state(ctx);
}
