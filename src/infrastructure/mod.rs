pub mod backup;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod local_store;
pub mod remote_store;
pub mod watcher;
