use serde::Serialize;

use crate::state::channels::ConnectionStatus;

#[derive(Clone, Debug)]
/// Dispatched payload carried across the SSE stream.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize)]
/// First event sent to an SSE client when it connects.
pub struct Handshake {
    pub participant_id: uuid::Uuid,
    pub connection: ConnectionStatus,
    /// Whether the store is unreachable and real-time is disabled.
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
/// Broadcast when the store enters or leaves degraded mode.
pub struct SystemStatus {
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
/// Broadcast when the aggregate channel status changes.
pub struct ConnectionChanged {
    pub status: ConnectionStatus,
}
