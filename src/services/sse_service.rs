use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    dto::{
        sse::{Handshake, ServerEvent},
        state::StateView,
    },
    state::ClientContext,
};

/// Subscribe to the state stream.
pub fn subscribe(ctx: &ClientContext) -> broadcast::Receiver<ServerEvent> {
    ctx.sse().subscribe()
}

/// Events a new subscriber receives before any broadcast: handshake and current state.
pub fn initial_events(ctx: &ClientContext) -> Vec<ServerEvent> {
    let handshake = Handshake {
        participant_id: ctx.participant_id(),
        connection: ctx.connection_status(),
        degraded: ctx.is_degraded(),
    };
    [
        ServerEvent::json(Some("handshake".to_string()), &handshake),
        ServerEvent::json(Some("state".to_string()), &StateView::capture(ctx)),
    ]
    .into_iter()
    .filter_map(|event| match event {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "failed to serialize initial SSE payload");
            None
        }
    })
    .collect()
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

/// Convert a broadcast receiver into an SSE response, forwarding events and
/// cleaning up once the client disconnects.
pub fn to_sse_stream(
    initial: Vec<ServerEvent>,
    mut receiver: broadcast::Receiver<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        for payload in initial {
            if tx.send(Ok(to_event(payload))).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // The next state event supersedes what was skipped.
                            debug!(skipped, "SSE subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }

        info!("state SSE stream disconnected");
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
