use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};

use crate::dao::data_store::EventSpec;

/// Name of the channel carrying room list updates.
pub const GLOBAL_CHANNEL: &str = "global-updates";

/// Name of the channel carrying the activities, options and responses of a room.
pub fn room_channel(room_id: uuid::Uuid) -> String {
    format!("room-{room_id}")
}

/// Aggregate real-time status shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Every channel is live.
    Connected,
    /// At least one channel is being retried.
    Reconnecting,
    /// Retry cap exhausted; only an explicit reconnect leaves this state.
    Disconnected,
}

/// Client side lifecycle of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Registered, never subscribed.
    Idle,
    /// A subscribe call is in flight.
    Subscribing,
    /// Events are forwarded to the sync loop.
    Subscribed,
    /// Last attempt failed or the subscription broke.
    Error(String),
    /// Cleaned up.
    Closed,
}

/// Registered channel: its selection, lifecycle state and event forwarder.
pub struct ChannelHandle {
    name: String,
    specs: Vec<EventSpec>,
    state: watch::Sender<ChannelState>,
    attempts: AtomicU32,
    /// Bumped on every successful subscription; stale loss reports carry an older one.
    generation: AtomicU64,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    fn new(name: String, specs: Vec<EventSpec>) -> Self {
        let (state, _rx) = watch::channel(ChannelState::Idle);
        Self {
            name,
            specs,
            state,
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            forwarder: Mutex::new(None),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tables and filters the channel listens to.
    pub fn specs(&self) -> &[EventSpec] {
        &self.specs
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Watch channel state changes.
    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Move to `subscribing` unless a subscription is already running or live.
    ///
    /// Returns `false` when the caller must not start another subscription.
    pub fn begin_subscribe(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ChannelState::Subscribing | ChannelState::Subscribed => false,
            ChannelState::Idle | ChannelState::Error(_) | ChannelState::Closed => {
                *state = ChannelState::Subscribing;
                true
            }
        })
    }

    /// Record a live subscription and return its generation.
    pub fn mark_subscribed(&self) -> u64 {
        self.attempts.store(0, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ChannelState::Subscribed);
        generation
    }

    /// Generation of the current live subscription.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record a failed attempt and return the number of consecutive failures.
    pub fn mark_failed(&self, reason: String) -> u32 {
        self.state.send_replace(ChannelState::Error(reason));
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// A live subscription broke; unlike [`Self::mark_failed`] no attempt is counted.
    pub fn mark_lost(&self, reason: String) {
        self.state.send_replace(ChannelState::Error(reason));
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Forget failed attempts.
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Install the task pumping feed events, aborting any previous one.
    pub fn install_forwarder(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.forwarder.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop forwarding and mark the channel closed.
    pub fn close(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.state.send_replace(ChannelState::Closed);
    }
}

/// Process wide registry of named channels, owned by the client context.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<ChannelHandle>>,
}

impl ChannelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered handle for `name`, registering it on first use.
    pub fn get_channel(&self, name: &str, specs: Vec<EventSpec>) -> Arc<ChannelHandle> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelHandle::new(name.to_string(), specs)))
            .clone()
    }

    /// Registered handle named `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.get(name).map(|entry| entry.clone())
    }

    /// Deregister `name`, returning the handle if it was registered.
    pub fn remove(&self, name: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.remove(name).map(|(_, handle)| handle)
    }

    /// Every registered handle.
    pub fn handles(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
