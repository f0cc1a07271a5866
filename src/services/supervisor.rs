use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    services::{connection_service, sse_events},
    state::SharedContext,
};

/// Probe the store once before anything subscribes.
///
/// Returns whether the store is reachable; an unreachable store puts the
/// client in degraded mode, where real-time is skipped and polling is used.
pub async fn check_startup(ctx: &SharedContext) -> bool {
    match ctx.repository().health_check().await {
        Ok(()) => {
            info!("storage reachable");
            ctx.update_degraded(false);
            true
        }
        Err(err) => {
            warn!(error = %err, "storage unreachable at startup; entering degraded mode");
            if ctx.update_degraded(true) {
                sse_events::broadcast_system_status(ctx, true);
            }
            false
        }
    }
}

/// Health-check the store forever, toggling degraded mode on transitions.
pub async fn run(ctx: SharedContext) {
    loop {
        sleep(ctx.config().health_check_interval).await;
        probe(&ctx).await;
    }
}

async fn probe(ctx: &SharedContext) {
    match ctx.repository().health_check().await {
        Ok(()) => {
            if ctx.update_degraded(false) {
                info!("storage healthy again; leaving degraded mode");
                sse_events::broadcast_system_status(ctx, false);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection_service::reconnect(&ctx).await {
                        warn!(error = %err, "reconnect after recovery failed");
                    }
                });
            }
        }
        Err(err) => {
            if ctx.update_degraded(true) {
                warn!(error = %err, "storage health check failed; entering degraded mode");
                sse_events::broadcast_system_status(ctx, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dao::{data_store::EventSpec, storage::Table},
        error::ServiceError,
        services::test_support::{context, settle},
        state::channels::{ConnectionStatus, GLOBAL_CHANNEL},
    };

    #[tokio::test]
    async fn unreachable_store_at_startup_disables_realtime() {
        let (ctx, backend) = context();
        backend.set_healthy(false);

        assert!(!check_startup(&ctx).await);
        connection_service::get_channel(&ctx, GLOBAL_CHANNEL, vec![EventSpec::table(Table::Rooms)]);
        let err = connection_service::subscribe(&ctx, GLOBAL_CHANNEL)
            .await
            .unwrap_err();

        assert!(ctx.is_degraded());
        assert!(matches!(err, ServiceError::Fatal(_)));
        assert!(!backend.has_channel(GLOBAL_CHANNEL));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_clears_degraded_and_reconnects() {
        let (ctx, backend) = context();
        backend.set_healthy(false);
        check_startup(&ctx).await;
        connection_service::get_channel(&ctx, GLOBAL_CHANNEL, vec![EventSpec::table(Table::Rooms)]);
        let _ = connection_service::subscribe(&ctx, GLOBAL_CHANNEL).await;
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);

        tokio::spawn(run(ctx.clone()));
        backend.set_healthy(true);
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle(&ctx).await;

        assert!(!ctx.is_degraded());
        assert!(backend.has_channel(GLOBAL_CHANNEL));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
    }
}
