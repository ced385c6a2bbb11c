//! Infrastructure layer: device-local persistence.

pub mod kv_store;

pub use kv_store::{SqliteKeyValueStore, default_store_path};
