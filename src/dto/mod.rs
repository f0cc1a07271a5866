pub mod activity;
pub mod health;
pub mod room;
pub mod sse;
pub mod state;
pub mod validation;
