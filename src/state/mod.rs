/// Channel registry and connection status.
pub mod channels;
/// Display target resolution.
pub mod display;
/// Participant profile and vote ledger.
pub mod participant;
/// Rooms, activities and per kind profiles.
pub mod room;
mod sse;
/// Reconciled room snapshot.
pub mod snapshot;
/// Trivia phase machine.
pub mod trivia;

use std::{path::PathBuf, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    dao::{
        data_store::{ChangeFeed, DataStore},
        repository::Repository,
    },
    services::sync_service::SyncMessage,
};

pub use self::sse::SseHub;
use self::{
    channels::{ChannelRegistry, ConnectionStatus},
    display::DisplayTarget,
    participant::ParticipantProfile,
    snapshot::RoomStore,
    trivia::TriviaMachine,
};

/// Context shared by tasks and handlers.
pub type SharedContext = Arc<ClientContext>;

const SSE_CAPACITY: usize = 64;

/// Timers owned by the joined room; aborted when the room is left.
#[derive(Default)]
struct SessionTasks {
    polling: Option<JoinHandle<()>>,
    trivia_driver: Option<JoinHandle<()>>,
}

/// Composition root of one client: collaborators, reconciled state and notifiers.
pub struct ClientContext {
    config: ClientConfig,
    repository: Repository,
    feed: Arc<dyn ChangeFeed>,
    channels: ChannelRegistry,
    store: RwLock<RoomStore>,
    trivia: Mutex<TriviaMachine>,
    participant: Mutex<ParticipantProfile>,
    participant_path: Option<PathBuf>,
    /// Room id and `responses_reset_at` last seen for the selected room.
    reset_marker: Mutex<Option<(Uuid, Option<String>)>>,
    session: Mutex<SessionTasks>,
    revision: watch::Sender<u64>,
    connection: watch::Sender<ConnectionStatus>,
    display: watch::Sender<DisplayTarget>,
    degraded: watch::Sender<bool>,
    sse: SseHub,
    sync_tx: mpsc::UnboundedSender<SyncMessage>,
    sync_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncMessage>>>,
    lifecycle_gate: AsyncMutex<()>,
    sync_gate: AsyncMutex<()>,
}

impl ClientContext {
    /// Build the context around a store and its change feed.
    ///
    /// The participant profile is read from the configured path, or generated.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn DataStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> SharedContext {
        let participant = match config.participant_state_path.as_deref() {
            Some(path) => ParticipantProfile::load_or_generate(path),
            None => ParticipantProfile::generate(),
        };
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (revision, _rx) = watch::channel(0);
        let (connection, _rx) = watch::channel(ConnectionStatus::Connected);
        let (display, _rx) = watch::channel(DisplayTarget::Idle);
        let (degraded, _rx) = watch::channel(false);

        Arc::new(Self {
            repository: Repository::new(store),
            feed,
            channels: ChannelRegistry::new(),
            store: RwLock::new(RoomStore::new(config.pending_deletion_ttl)),
            trivia: Mutex::new(TriviaMachine::new(
                config.trivia_lead_in,
                config.trivia_reveal_delay,
            )),
            participant: Mutex::new(participant),
            participant_path: config.participant_state_path.clone(),
            reset_marker: Mutex::new(None),
            session: Mutex::new(SessionTasks::default()),
            revision,
            connection,
            display,
            degraded,
            sse: SseHub::new(SSE_CAPACITY),
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
            lifecycle_gate: AsyncMutex::new(()),
            sync_gate: AsyncMutex::new(()),
            config,
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Typed store access.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Change feed backing the channels.
    pub fn feed(&self) -> &Arc<dyn ChangeFeed> {
        &self.feed
    }

    /// Registered channels.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Read the reconciled snapshot.
    pub fn with_store<R>(&self, f: impl FnOnce(&RoomStore) -> R) -> R {
        f(&self.store.read())
    }

    /// Mutate the snapshot and notify revision watchers when it changed.
    pub fn with_store_mut<R>(&self, f: impl FnOnce(&mut RoomStore) -> R) -> R {
        let (result, revision) = {
            let mut store = self.store.write();
            let result = f(&mut store);
            (result, store.revision())
        };
        self.revision.send_if_modified(|current| {
            if *current == revision {
                false
            } else {
                *current = revision;
                true
            }
        });
        result
    }

    /// Watch the snapshot revision.
    pub fn revision_watcher(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Read the trivia machine.
    pub fn with_trivia<R>(&self, f: impl FnOnce(&TriviaMachine) -> R) -> R {
        f(&self.trivia.lock())
    }

    /// Mutate the trivia machine.
    pub fn with_trivia_mut<R>(&self, f: impl FnOnce(&mut TriviaMachine) -> R) -> R {
        f(&mut self.trivia.lock())
    }

    /// Local participant id.
    pub fn participant_id(&self) -> Uuid {
        self.participant.lock().participant_id
    }

    /// Read the participant profile.
    pub fn with_participant<R>(&self, f: impl FnOnce(&ParticipantProfile) -> R) -> R {
        f(&self.participant.lock())
    }

    /// Mutate the participant profile, persisting it when `f` reports a change.
    pub fn with_participant_mut(&self, f: impl FnOnce(&mut ParticipantProfile) -> bool) -> bool {
        let snapshot = {
            let mut profile = self.participant.lock();
            if !f(&mut profile) {
                return false;
            }
            profile.clone()
        };
        if let Some(path) = self.participant_path.as_deref()
            && let Err(err) = snapshot.save(path)
        {
            warn!(path = %path.display(), error = %err, "failed to persist participant profile");
        }
        true
    }

    /// Swap the remembered reset marker, returning the previous one.
    pub fn replace_reset_marker(
        &self,
        marker: Option<(Uuid, Option<String>)>,
    ) -> Option<(Uuid, Option<String>)> {
        std::mem::replace(&mut *self.reset_marker.lock(), marker)
    }

    /// Aggregate real-time status.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    /// Watch the aggregate status.
    pub fn connection_watcher(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    /// Publish a connection status; returns whether it changed.
    pub fn set_connection_status(&self, status: ConnectionStatus) -> bool {
        self.connection.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Current display target.
    pub fn display(&self) -> DisplayTarget {
        *self.display.borrow()
    }

    /// Watch the display target.
    pub fn display_watcher(&self) -> watch::Receiver<DisplayTarget> {
        self.display.subscribe()
    }

    /// Publish the resolved display target; returns whether it changed.
    pub fn publish_display(&self, target: DisplayTarget) -> bool {
        self.display.send_if_modified(|current| {
            if *current == target {
                false
            } else {
                *current = target;
                true
            }
        })
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Update the degraded flag; returns whether it changed.
    pub fn update_degraded(&self, value: bool) -> bool {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Broadcast hub used for the state SSE stream.
    pub fn sse(&self) -> &SseHub {
        &self.sse
    }

    /// Queue a message for the sync loop.
    pub fn send_sync(&self, message: SyncMessage) {
        if self.sync_tx.send(message).is_err() {
            warn!("sync loop is gone; dropping message");
        }
    }

    /// Hand the sync inbox to its single consumer.
    pub fn take_sync_inbox(&self) -> Option<mpsc::UnboundedReceiver<SyncMessage>> {
        self.sync_rx.lock().take()
    }

    /// Pop one queued sync message without waiting, unless the inbox was taken.
    pub fn try_next_sync(&self) -> Option<SyncMessage> {
        self.sync_rx
            .lock()
            .as_mut()
            .and_then(|inbox| inbox.try_recv().ok())
    }

    /// Serializes lifecycle operations of this client.
    pub fn lifecycle_gate(&self) -> &AsyncMutex<()> {
        &self.lifecycle_gate
    }

    /// Held while a sync message is applied or a full reload runs.
    pub fn sync_gate(&self) -> &AsyncMutex<()> {
        &self.sync_gate
    }

    /// Install the polling fallback timer, aborting the previous one.
    pub fn replace_polling(&self, task: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut self.session.lock().polling, task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Install the trivia timer driver, aborting the previous one.
    pub fn replace_trivia_driver(&self, task: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut self.session.lock().trivia_driver, task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether the polling fallback timer is installed.
    pub fn has_polling(&self) -> bool {
        self.session.lock().polling.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::{dao::models::RoomEntity, services::test_support::context, state::room::Room};

    #[tokio::test]
    async fn watchers_only_wake_on_real_changes() {
        let (ctx, _backend) = context();
        let mut revisions = ctx.revision_watcher();
        let mut connection = ctx.connection_watcher();
        let mut display = ctx.display_watcher();

        ctx.with_store(|store| store.revision());
        assert!(!revisions.has_changed().unwrap());

        ctx.with_store_mut(|store| {
            store.select(Room::from(RoomEntity {
                id: Uuid::new_v4(),
                code: "4821".into(),
                name: "Room".into(),
                is_active: true,
                current_activity_id: None,
                participant_count: 0,
                settings: Map::new(),
                responses_reset_at: None,
            }))
        });
        assert!(revisions.has_changed().unwrap());

        assert!(!ctx.set_connection_status(ConnectionStatus::Connected));
        assert!(!connection.has_changed().unwrap());
        assert!(ctx.set_connection_status(ConnectionStatus::Reconnecting));
        assert_eq!(*connection.borrow_and_update(), ConnectionStatus::Reconnecting);

        assert!(!ctx.publish_display(DisplayTarget::Idle));
        assert!(!display.has_changed().unwrap());
    }
}
