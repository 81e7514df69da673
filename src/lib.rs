//! Replica Sync
//!
//! Offline-first synchronization of an embedded SQLite replica with a
//! remote authoritative store.

pub mod config;
pub mod db;
pub mod sync;

pub use config::{Config, ConfigError, ConfigSource, ConfigValue, SyncConfig};
pub use db::{init_db, ReplicaStore, Row, RowKey, StoreError, SyncInfo, Timestamp, Value};
pub use sync::{
    EngineOptions, HttpRemote, OfflineSession, RemoteAuthority, RoundReport, RoundState,
    SessionTracker, SyncEngine, SyncError,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
