//! Persistent reactive key-value stores backed by one JSON file each.

pub mod config;
pub mod error;
pub mod service;
pub mod store;
mod watch;

pub use config::{StoreConfig, StoreFormat, DEFAULT_FLUSH_DEBOUNCE};
pub use error::StoreError;
pub use service::{KeyRequest, RemoteStore, StoreService, WriteRequest};
pub use store::{Entry, KeySubscription, KvStore};
