//! Channel subscriptions: bounded retries, loss detection and the aggregate
//! connection status shown to the UI.

use std::sync::Arc;

use futures::{StreamExt, future::join_all};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    dao::data_store::{EventSpec, FeedStatus, FeedSubscription},
    error::ServiceError,
    services::{sse_events, sync_service::SyncMessage},
    state::{
        ClientContext, SharedContext,
        channels::{ChannelHandle, ChannelState, ConnectionStatus},
    },
};

/// How a call to [`subscribe`] ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The channel is live and its events are forwarded to the sync loop.
    Subscribed,
    /// Another call is already subscribing, or the channel is live.
    AlreadyActive,
    /// The channel was cleaned up while the subscription was in flight.
    Abandoned,
}

/// Return the registered channel, registering it on first use.
pub fn get_channel(ctx: &ClientContext, name: &str, specs: Vec<EventSpec>) -> Arc<ChannelHandle> {
    ctx.channels().get_channel(name, specs)
}

/// Subscribe a registered channel, retrying with a linear backoff.
///
/// Reaching the attempt cap sets the terminal `disconnected` status and
/// returns the last error.
pub async fn subscribe(ctx: &SharedContext, name: &str) -> Result<SubscribeOutcome, ServiceError> {
    let Some(handle) = ctx.channels().get(name) else {
        debug!(channel = name, "subscribe requested for an unregistered channel");
        return Ok(SubscribeOutcome::Abandoned);
    };
    if !handle.begin_subscribe() {
        return Ok(SubscribeOutcome::AlreadyActive);
    }

    if !ctx.feed().is_live() || ctx.is_degraded() {
        let reason = if ctx.is_degraded() {
            "store unreachable; real-time disabled"
        } else {
            "backend has no change feed; real-time disabled"
        };
        handle.mark_failed(reason.to_string());
        warn!(channel = name, reason, "falling back to polling");
        set_status(ctx, ConnectionStatus::Disconnected);
        return Err(ServiceError::Fatal(reason.to_string()));
    }

    loop {
        match ctx.feed().subscribe(name, handle.specs().to_vec()).await {
            Ok(subscription) => {
                if !is_registered(ctx, &handle) {
                    debug!(channel = name, "channel cleaned up during subscribe");
                    ctx.feed().unsubscribe(name);
                    return Ok(SubscribeOutcome::Abandoned);
                }
                let generation = handle.mark_subscribed();
                let forwarder = tokio::spawn(forward(
                    ctx.clone(),
                    name.to_string(),
                    generation,
                    subscription,
                ));
                handle.install_forwarder(forwarder);
                info!(channel = name, generation, "channel subscribed");
                recompute_status(ctx);
                return Ok(SubscribeOutcome::Subscribed);
            }
            Err(err) => {
                let attempts = handle.mark_failed(err.to_string());
                if attempts >= ctx.config().subscribe_max_attempts {
                    error!(channel = name, attempts, error = %err, "giving up on channel");
                    set_status(ctx, ConnectionStatus::Disconnected);
                    return Err(err.into());
                }

                let delay = ctx.config().backoff_delay(attempts);
                warn!(channel = name, attempts, ?delay, error = %err, "subscription failed; retrying");
                recompute_status(ctx);
                sleep(delay).await;

                if !is_registered(ctx, &handle) || !handle.begin_subscribe() {
                    return Ok(SubscribeOutcome::Abandoned);
                }
            }
        }
    }
}

/// Unsubscribe and deregister a channel. Unknown names are ignored.
pub fn cleanup(ctx: &ClientContext, name: &str) {
    let Some(handle) = ctx.channels().remove(name) else {
        return;
    };
    handle.close();
    ctx.feed().unsubscribe(name);
    info!(channel = name, "channel cleaned up");
    recompute_status(ctx);
}

/// Reset attempt counters and resubscribe every registered channel, then reload.
pub async fn reconnect(ctx: &SharedContext) -> Result<(), ServiceError> {
    let handles = ctx.channels().handles();
    for handle in &handles {
        handle.reset_attempts();
    }
    set_status(ctx, ConnectionStatus::Reconnecting);
    info!(channels = handles.len(), "reconnecting");

    let results = join_all(handles.iter().map(|handle| subscribe(ctx, handle.name()))).await;
    let mut failure = None;
    for (handle, result) in handles.iter().zip(results) {
        if let Err(err) = result {
            warn!(channel = handle.name(), error = %err, "reconnect failed");
            failure.get_or_insert(err);
        }
    }

    recompute_status(ctx);
    ctx.send_sync(SyncMessage::Resynchronize);
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// React to a broken live subscription reported by its forwarder.
pub fn handle_channel_lost(ctx: &SharedContext, name: &str, generation: u64, reason: String) {
    let Some(handle) = ctx.channels().get(name) else {
        debug!(channel = name, "loss reported for a cleaned up channel");
        return;
    };
    if handle.generation() != generation || handle.state() != ChannelState::Subscribed {
        debug!(channel = name, generation, "stale loss report");
        return;
    }

    warn!(channel = name, reason, "channel lost; resubscribing");
    handle.mark_lost(reason);
    recompute_status(ctx);

    let ctx = ctx.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        match subscribe(&ctx, &name).await {
            Ok(SubscribeOutcome::Subscribed) => ctx.send_sync(SyncMessage::Resynchronize),
            Ok(_) => {}
            Err(err) => warn!(channel = %name, error = %err, "resubscription failed"),
        }
    });
}

/// Derive the aggregate status from the registered channels.
///
/// `disconnected` is sticky: only a successful subscription of every channel
/// leaves it.
pub fn recompute_status(ctx: &ClientContext) {
    let all_live = ctx
        .channels()
        .handles()
        .iter()
        .all(|handle| handle.state() == ChannelState::Subscribed);
    let next = if all_live {
        ConnectionStatus::Connected
    } else if ctx.connection_status() == ConnectionStatus::Disconnected {
        ConnectionStatus::Disconnected
    } else {
        ConnectionStatus::Reconnecting
    };
    set_status(ctx, next);
}

fn set_status(ctx: &ClientContext, status: ConnectionStatus) {
    if ctx.set_connection_status(status) {
        info!(?status, "connection status changed");
        sse_events::broadcast_connection(ctx, status);
    }
}

fn is_registered(ctx: &ClientContext, handle: &Arc<ChannelHandle>) -> bool {
    ctx.channels()
        .get(handle.name())
        .is_some_and(|current| Arc::ptr_eq(&current, handle))
}

/// Pump feed events into the sync loop until the subscription breaks.
async fn forward(
    ctx: SharedContext,
    channel: String,
    generation: u64,
    subscription: FeedSubscription,
) {
    let FeedSubscription {
        mut status,
        mut events,
    } = subscription;

    let reason = loop {
        tokio::select! {
            biased;
            changed = status.changed() => {
                if changed.is_err() {
                    break "feed dropped the channel".to_string();
                }
                let current = status.borrow_and_update().clone();
                match current {
                    FeedStatus::Error(reason) => break reason,
                    FeedStatus::Closed => break "channel closed".to_string(),
                    FeedStatus::Subscribing | FeedStatus::Subscribed => continue,
                }
            }
            next = events.next() => match next {
                Some(event) => ctx.send_sync(SyncMessage::Event {
                    channel: channel.clone(),
                    event,
                }),
                None => break "event stream ended".to_string(),
            },
        }
    };

    ctx.send_sync(SyncMessage::ChannelLost {
        channel,
        generation,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dao::{
            data_store::{ChangeFeed, NoFeed},
            storage::Table,
        },
        services::test_support::{context, seed_room, settle},
        state::channels::GLOBAL_CHANNEL,
    };

    fn global_specs() -> Vec<EventSpec> {
        vec![EventSpec::table(Table::Rooms)]
    }

    #[tokio::test]
    async fn subscribed_channel_forwards_events_into_the_store() {
        let (ctx, backend) = context();
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());

        let outcome = subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);

        let room = seed_room(&backend, "4821").await;
        settle(&ctx).await;

        assert!(ctx.with_store(|store| store.room(room.id).is_some()));
    }

    #[tokio::test]
    async fn concurrent_subscribe_calls_subscribe_once() {
        let (ctx, backend) = context();
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());

        let (first, second) = tokio::join!(
            subscribe(&ctx, GLOBAL_CHANNEL),
            subscribe(&ctx, GLOBAL_CHANNEL)
        );
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome as u8);

        assert_eq!(
            outcomes,
            vec![SubscribeOutcome::Subscribed, SubscribeOutcome::AlreadyActive]
        );
        assert!(backend.has_channel(GLOBAL_CHANNEL));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_disconnects() {
        let (ctx, backend) = context();
        backend.fail_subscriptions(10);
        let handle = get_channel(&ctx, GLOBAL_CHANNEL, global_specs());

        let started = tokio::time::Instant::now();
        let err = subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap_err();

        assert!(matches!(err, ServiceError::Transient(_)));
        assert_eq!(handle.attempts(), 3);
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        // Two waits: 3s after the first failure, 6s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_refusals_recover_within_the_cap() {
        let (ctx, backend) = context();
        backend.fail_subscriptions(2);
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());

        let outcome = subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap();

        assert_eq!(outcome, SubscribeOutcome::Subscribed);
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_leaves_disconnected() {
        let (ctx, backend) = context();
        backend.fail_subscriptions(3);
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());
        assert!(subscribe(&ctx, GLOBAL_CHANNEL).await.is_err());
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);

        reconnect(&ctx).await.unwrap();

        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
        assert!(backend.has_channel(GLOBAL_CHANNEL));
    }

    #[tokio::test]
    async fn dropped_channel_is_resubscribed_and_reloaded() {
        let (ctx, backend) = context();
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());
        subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap();

        backend.drop_channel(GLOBAL_CHANNEL);
        // Written while the channel is down: only the reload can surface it.
        let missed = seed_room(&backend, "1357").await;
        settle(&ctx).await;

        assert!(backend.has_channel(GLOBAL_CHANNEL));
        assert_eq!(
            ctx.channels().get(GLOBAL_CHANNEL).unwrap().state(),
            ChannelState::Subscribed
        );
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
        assert!(ctx.with_store(|store| store.room(missed.id).is_some()));
    }

    #[tokio::test]
    async fn cleanup_is_safe_to_repeat() {
        let (ctx, backend) = context();
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());
        subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap();

        cleanup(&ctx, GLOBAL_CHANNEL);
        cleanup(&ctx, GLOBAL_CHANNEL);

        assert!(ctx.channels().is_empty());
        assert!(!backend.has_channel(GLOBAL_CHANNEL));
        assert_eq!(
            subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap(),
            SubscribeOutcome::Abandoned
        );
    }

    #[tokio::test]
    async fn backends_without_a_feed_disconnect_immediately() {
        let feed: Arc<dyn ChangeFeed> = Arc::new(NoFeed);
        let (ctx, _backend) = crate::services::test_support::context_with_feed(feed);
        get_channel(&ctx, GLOBAL_CHANNEL, global_specs());

        let err = subscribe(&ctx, GLOBAL_CHANNEL).await.unwrap_err();

        assert!(matches!(err, ServiceError::Fatal(_)));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
    }
}
