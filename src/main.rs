//! live-vote-sync binary entrypoint wiring the store backend, the sync loop,
//! the health supervisor and the HTTP/SSE surface.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use live_vote_sync::{
    config::ClientConfig,
    dao::{
        data_store::{ChangeFeed, DataStore, EventSpec, memory::MemoryBackend},
        storage::Table,
    },
    routes,
    services::{connection_service, supervisor, sync_service},
    state::{ClientContext, SharedContext, channels::GLOBAL_CHANNEL},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::load();
    let (store, feed) = build_backend()?;
    let ctx = ClientContext::new(config, store, feed);
    info!(participant_id = %ctx.participant_id(), "client context ready");

    supervisor::check_startup(&ctx).await;
    tokio::spawn(sync_service::run(ctx.clone()));
    tokio::spawn(supervisor::run(ctx.clone()));
    start_global_channel(&ctx);

    let app = build_router(ctx);

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the store backend from `LIVE_VOTE_BACKEND` (`memory` or `postgrest`).
fn build_backend() -> anyhow::Result<(Arc<dyn DataStore>, Arc<dyn ChangeFeed>)> {
    let backend = env::var("LIVE_VOTE_BACKEND").unwrap_or_else(|_| "memory".into());
    match backend.as_str() {
        "memory" => {
            let memory = MemoryBackend::new();
            Ok((Arc::new(memory.clone()), Arc::new(memory)))
        }
        #[cfg(feature = "rest-store")]
        "postgrest" => {
            use live_vote_sync::dao::data_store::{
                NoFeed,
                postgrest::{PostgrestConfig, PostgrestStore},
            };

            let config = PostgrestConfig::from_env().context("reading PostgREST settings")?;
            info!(base_url = %config.base_url, "using PostgREST store without push feed");
            let store = PostgrestStore::connect(config).context("building PostgREST client")?;
            Ok((Arc::new(store), Arc::new(NoFeed)))
        }
        other => anyhow::bail!("unknown LIVE_VOTE_BACKEND `{other}`"),
    }
}

/// Register the room list channel, subscribe it and load the room list.
///
/// In degraded mode the subscription fails fast and the supervisor
/// reconnects once the store is back.
fn start_global_channel(ctx: &SharedContext) {
    connection_service::get_channel(ctx, GLOBAL_CHANNEL, vec![EventSpec::table(Table::Rooms)]);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(err) = connection_service::subscribe(&ctx, GLOBAL_CHANNEL).await {
            warn!(error = %err, "global channel unavailable; relying on polling");
        }
        ctx.send_sync(sync_service::SyncMessage::Resynchronize);
    });
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(ctx: SharedContext) -> Router<()> {
    routes::router(ctx)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
