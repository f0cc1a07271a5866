//! Library crate for live-vote-sync, the client sync core of a live voting and
//! trivia room, exposed to a local UI over HTTP and Server-Sent Events.

/// Client configuration loaded from JSON.
pub mod config;
/// Store access: traits, backends and typed queries.
pub mod dao;
mod dto;
mod error;
/// HTTP and SSE surface.
pub mod routes;
/// Sync, lifecycle, voting and supervision services.
pub mod services;
/// Client context and reconciled local state.
pub mod state;
