//! Room sessions: joining by code, leaving, listing and creating rooms.

use rand::Rng;
use serde_json::Map;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        data_store::EventSpec,
        models::RoomEntity,
        storage::{Filter, StorageError, Table},
    },
    error::ServiceError,
    services::{
        connection_service,
        sse_events,
        sync_service::{self, SyncMessage},
        trivia_service,
    },
    state::{
        SharedContext,
        channels::{ConnectionStatus, room_channel},
        room::Room,
    },
};

const CODE_ATTEMPTS: usize = 10;

/// Tables multiplexed onto a room's channel.
fn room_specs(room_id: Uuid) -> Vec<EventSpec> {
    let room_filter = || Filter::all().eq("room_id", room_id.to_string());
    vec![
        EventSpec::filtered(Table::Activities, room_filter()),
        // Options carry no room column; the merge drops those of unknown activities.
        EventSpec::table(Table::ActivityOptions),
        EventSpec::filtered(Table::ParticipantResponses, room_filter()),
        EventSpec::filtered(Table::Rooms, Filter::by_id(room_id)),
    ]
}

/// Join the room with `code`, tearing down any previous session.
pub async fn join_room(ctx: &SharedContext, code: &str) -> Result<Room, ServiceError> {
    let expected = ctx.config().room_code_length;
    if code.len() != expected || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidInput(format!(
            "room code must be {expected} digits"
        )));
    }

    let current = ctx.with_store(|store| {
        store
            .selected_room()
            .filter(|room| room.code == code)
            .cloned()
    });
    if let Some(room) = current {
        debug!(room_id = %room.id, "room already joined");
        return Ok(room);
    }

    let Some(entity) = ctx.repository().find_room_by_code(code).await? else {
        return Err(ServiceError::NotFound(format!("no room with code `{code}`")));
    };
    let room = Room::from(entity);

    leave_room(ctx);
    ctx.with_store_mut(|store| store.select(room.clone()));
    ctx.replace_reset_marker(Some((room.id, room.responses_reset_at.clone())));

    let channel = room_channel(room.id);
    connection_service::get_channel(ctx, &channel, room_specs(room.id));
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = connection_service::subscribe(&ctx, &channel).await {
                warn!(channel, error = %err, "room channel unavailable; polling instead");
            }
        });
    }
    ctx.replace_polling(Some(spawn_polling(ctx)));
    info!(room_id = %room.id, code, "joined room");

    sync_service::reload(ctx).await?;
    Ok(ctx
        .with_store(|store| store.selected_room().cloned())
        .unwrap_or(room))
}

/// Leave the selected room: channel, timers and local state.
pub fn leave_room(ctx: &SharedContext) {
    let selected = ctx.with_store(|store| store.selected_room_id());
    if let Some(room_id) = selected {
        connection_service::cleanup(ctx, &room_channel(room_id));
    }
    ctx.replace_polling(None);
    trivia_service::cancel(ctx);
    ctx.with_store_mut(|store| store.clear_selection());
    ctx.replace_reset_marker(None);
    sync_service::refresh_views(ctx);
    if let Some(room_id) = selected {
        info!(%room_id, "left room");
    }
}

/// Reload the selected room on a timer while real-time delivery is not live.
fn spawn_polling(ctx: &SharedContext) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut ticker = interval(ctx.config().polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ctx.connection_status() == ConnectionStatus::Connected && !ctx.is_degraded() {
                continue;
            }
            debug!("real-time unavailable; polling");
            ctx.send_sync(SyncMessage::Resynchronize);
        }
    })
}

/// Authoritative room listing; also refreshes the local list.
pub async fn list_rooms(ctx: &SharedContext) -> Result<Vec<Room>, ServiceError> {
    let rooms: Vec<Room> = ctx
        .repository()
        .list_rooms()
        .await?
        .into_iter()
        .map(Room::from)
        .collect();
    ctx.with_store_mut(|store| store.replace_rooms(rooms.clone()));
    Ok(rooms)
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Create a room under a freshly generated unique code.
pub async fn create_room(ctx: &SharedContext, name: &str) -> Result<Room, ServiceError> {
    let length = ctx.config().room_code_length;
    for attempt in 1..=CODE_ATTEMPTS {
        let code = generate_code(length);
        if ctx.repository().find_room_by_code(&code).await?.is_some() {
            debug!(attempt, "room code taken");
            continue;
        }

        let entity = RoomEntity {
            id: Uuid::new_v4(),
            code,
            name: name.to_string(),
            is_active: true,
            current_activity_id: None,
            participant_count: 0,
            settings: Map::new(),
            responses_reset_at: None,
        };
        match ctx.repository().insert_room(&entity).await {
            Ok(stored) => {
                let room = Room::from(stored);
                ctx.with_store_mut(|store| {
                    let mut rooms: Vec<Room> = store.rooms().cloned().collect();
                    rooms.push(room.clone());
                    store.replace_rooms(rooms);
                });
                sse_events::broadcast_state(ctx);
                info!(room_id = %room.id, code = %room.code, "room created");
                return Ok(room);
            }
            Err(StorageError::Conflict { message, .. }) => {
                debug!(attempt, message, "room code raced");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(ServiceError::Conflict(format!(
        "no free room code after {CODE_ATTEMPTS} attempts"
    )))
}

/// Manual full reload.
pub async fn refresh(ctx: &SharedContext) -> Result<(), ServiceError> {
    sync_service::reload(ctx).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dao::models::ActivityKind,
        services::test_support::{context, seed_activity, seed_room, settle},
    };

    #[tokio::test]
    async fn join_loads_the_room_and_subscribes_its_channel() {
        let (ctx, backend) = context();
        let room = seed_room(&backend, "4821").await;
        let poll = seed_activity(&backend, room.id, ActivityKind::Poll, 0, &[("Yes", false), ("No", false)]).await;

        let joined = join_room(&ctx, "4821").await.unwrap();
        settle(&ctx).await;

        assert_eq!(joined.id, room.id);
        assert_eq!(
            ctx.with_store(|store| store.activity(poll.id).map(|a| a.options.len())),
            Some(2)
        );
        assert!(backend.has_channel(&room_channel(room.id)));
        assert!(ctx.has_polling());
    }

    #[tokio::test]
    async fn joining_twice_keeps_one_session() {
        let (ctx, backend) = context();
        seed_room(&backend, "4821").await;

        let first = join_room(&ctx, "4821").await.unwrap();
        settle(&ctx).await;
        let second = join_room(&ctx, "4821").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ctx.channels().handles().len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_codes_are_rejected() {
        let (ctx, _backend) = context();

        assert!(matches!(
            join_room(&ctx, "0000").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            join_room(&ctx, "48a1").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            join_room(&ctx, "48210").await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn switching_rooms_tears_down_the_previous_session() {
        let (ctx, backend) = context();
        let first = seed_room(&backend, "1111").await;
        let second = seed_room(&backend, "2222").await;

        join_room(&ctx, "1111").await.unwrap();
        settle(&ctx).await;
        join_room(&ctx, "2222").await.unwrap();
        settle(&ctx).await;

        assert!(!backend.has_channel(&room_channel(first.id)));
        assert!(backend.has_channel(&room_channel(second.id)));
        assert_eq!(ctx.with_store(|store| store.selected_room_id()), Some(second.id));
    }

    #[tokio::test]
    async fn leave_clears_selection_and_timers() {
        let (ctx, backend) = context();
        let room = seed_room(&backend, "4821").await;
        join_room(&ctx, "4821").await.unwrap();
        settle(&ctx).await;

        leave_room(&ctx);

        assert!(ctx.channels().is_empty());
        assert!(!backend.has_channel(&room_channel(room.id)));
        assert!(!ctx.has_polling());
        assert_eq!(ctx.with_store(|store| store.selected_room_id()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reloads_while_the_feed_is_down() {
        let (ctx, backend) = context();
        backend.fail_subscriptions(10);
        let room = seed_room(&backend, "4821").await;
        join_room(&ctx, "4821").await.unwrap();

        let late = seed_activity(&backend, room.id, ActivityKind::Poll, 0, &[("A", false), ("B", false)]).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle(&ctx).await;

        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        assert!(ctx.with_store(|store| store.activity(late.id).is_some()));
    }

    #[tokio::test]
    async fn created_rooms_get_unique_numeric_codes() {
        let (ctx, backend) = context();

        let first = create_room(&ctx, "Morning session").await.unwrap();
        let second = create_room(&ctx, "Afternoon session").await.unwrap();

        assert_eq!(first.code.len(), 4);
        assert!(first.code.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(first.code, second.code);
        assert_eq!(backend.rows(Table::Rooms).len(), 2);
        assert_eq!(ctx.with_store(|store| store.rooms().count()), 2);
    }
}
