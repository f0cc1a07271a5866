/// Backends implementing the store and change feed interfaces.
pub mod data_store;
/// Wire record definitions.
pub mod models;
/// Typed access to the backing store.
pub mod repository;
/// Storage abstraction layer for database operations.
pub mod storage;
