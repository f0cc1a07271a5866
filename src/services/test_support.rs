//! Fixtures shared by the service tests.

use std::sync::Arc;

use serde_json::Map;
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    dao::{
        data_store::{ChangeFeed, DataStore, NoFeed, memory::MemoryBackend},
        models::{ActivityEntity, ActivityKind, OptionEntity, RoomEntity},
        repository::Repository,
    },
    services::sync_service,
    state::{ClientContext, SharedContext},
};

fn test_config() -> ClientConfig {
    ClientConfig {
        participant_state_path: None,
        ..ClientConfig::default()
    }
}

/// Context over a fresh memory backend that also serves as the change feed.
pub fn context() -> (SharedContext, MemoryBackend) {
    let backend = MemoryBackend::new();
    let feed: Arc<dyn ChangeFeed> = Arc::new(backend.clone());
    context_over(backend, feed)
}

/// Context over a fresh memory backend with a different change feed.
pub fn context_with_feed(feed: Arc<dyn ChangeFeed>) -> (SharedContext, MemoryBackend) {
    context_over(MemoryBackend::new(), feed)
}

/// Context over an arbitrary store, typically a wrapper around `backend`.
pub fn context_over_store(store: Arc<dyn DataStore>, feed: Arc<dyn ChangeFeed>) -> SharedContext {
    ClientContext::new(test_config(), store, feed)
}

/// Second client on `backend` that only learns about changes from what it is fed.
pub fn detached_client(backend: &MemoryBackend) -> SharedContext {
    context_over_store(Arc::new(backend.clone()), Arc::new(NoFeed))
}

fn context_over(backend: MemoryBackend, feed: Arc<dyn ChangeFeed>) -> (SharedContext, MemoryBackend) {
    let ctx = ClientContext::new(test_config(), Arc::new(backend.clone()), feed);
    (ctx, backend)
}

/// Let spawned tasks run and process whatever they queued for the sync loop.
pub async fn settle(ctx: &SharedContext) {
    for _ in 0..16 {
        tokio::task::yield_now().await;
        sync_service::drain(ctx).await;
    }
}

pub async fn seed_room(backend: &MemoryBackend, code: &str) -> RoomEntity {
    let room = RoomEntity {
        id: Uuid::new_v4(),
        code: code.to_string(),
        name: format!("Room {code}"),
        is_active: true,
        current_activity_id: None,
        participant_count: 0,
        settings: Map::new(),
        responses_reset_at: None,
    };
    Repository::new(Arc::new(backend.clone()))
        .insert_room(&room)
        .await
        .unwrap()
}

/// Insert an activity with one option per `(text, is_correct)` pair.
pub async fn seed_activity(
    backend: &MemoryBackend,
    room_id: Uuid,
    kind: ActivityKind,
    order: i32,
    options: &[(&str, bool)],
) -> ActivityEntity {
    let repository = Repository::new(Arc::new(backend.clone()));
    let activity = repository
        .insert_activity(&ActivityEntity {
            id: Uuid::new_v4(),
            room_id,
            kind,
            title: format!("Question {order}"),
            is_active: false,
            total_responses: 0,
            order,
            settings: Map::new(),
        })
        .await
        .unwrap();
    for (index, (text, is_correct)) in options.iter().enumerate() {
        repository
            .insert_option(&OptionEntity {
                id: Uuid::new_v4(),
                activity_id: activity.id,
                text: text.to_string(),
                is_correct: *is_correct,
                response_count: 0,
                order: index as i32,
            })
            .await
            .unwrap();
    }
    activity
}
