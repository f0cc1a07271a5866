mod config;
mod error;
mod store;

pub use config::PostgrestConfig;
pub use store::PostgrestStore;
