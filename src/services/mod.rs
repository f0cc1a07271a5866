/// Channel subscriptions, retries and the aggregate connection status.
pub mod connection_service;
/// Health check service.
pub mod health_service;
/// Multi-step activity lifecycle operations.
pub mod lifecycle_service;
/// Room sessions: join, leave, list and create.
pub mod room_service;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// Store health supervision and degraded mode.
pub mod supervisor;
/// Change event merging and full reloads.
pub mod sync_service;
/// Local trivia timeline driver.
pub mod trivia_service;
/// Vote submission guard and counters.
pub mod vote_service;

#[cfg(test)]
pub(crate) mod test_support;
