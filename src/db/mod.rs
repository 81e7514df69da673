mod replica;
mod value;

pub use replica::{
    ForeignKey, LocalChange, ReplicaStore, StoreError, SyncInfo, SyncInfoFilter, TableRef,
    TableSchema, SYNC_INFO_SUFFIX,
};
pub use value::{row, Row, RowKey, Timestamp, Value};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the replica connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Replica fixtures shared by the engine tests.
    //!
    //! `publishers <- books <- reviews`, all synced. Books point at
    //! publishers twice, as publisher and as distributor.

    use super::*;
    use tempfile::TempDir;

    pub const SCHEMA: &str = r#"
        CREATE TABLE publishers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE books (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            publisher INTEGER REFERENCES publishers(id),
            distributor INTEGER REFERENCES publishers(id)
        );
        CREATE TABLE reviews (
            id INTEGER PRIMARY KEY,
            body TEXT,
            book INTEGER REFERENCES books(id)
        );
    "#;

    pub fn synced_tables() -> Vec<String> {
        vec![
            "publishers".to_string(),
            "books".to_string(),
            "reviews".to_string(),
        ]
    }

    /// Opens a fresh replica in a temp dir. Keep the `TempDir` alive.
    pub async fn replica() -> (TempDir, ReplicaStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(&dir.path().join("replica.db")).await.unwrap();
        sqlx::raw_sql(SCHEMA).execute(&pool).await.unwrap();
        let store = ReplicaStore::open(pool, &synced_tables()).await.unwrap();
        (dir, store)
    }

    /// Inserts a row acknowledged by the remote at `ts`.
    pub async fn seed_synced(store: &ReplicaStore, table: &str, data: Row, ts: Timestamp) {
        let mut conn = store.pool().acquire().await.unwrap();
        let key = data["id"].as_key().unwrap();
        store.upsert_row(&mut conn, table, &data).await.unwrap();
        store
            .write_sync_info(&mut conn, table, &[SyncInfo::synced(key, ts)])
            .await
            .unwrap();
    }

    pub async fn sync_info(store: &ReplicaStore, table: &str, key: RowKey) -> Option<SyncInfo> {
        let mut conn = store.pool().acquire().await.unwrap();
        store
            .read_sync_info(&mut conn, table, SyncInfoFilter::Keys(&[key]))
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    pub async fn read_row(store: &ReplicaStore, table: &str, key: RowKey) -> Option<Row> {
        let mut conn = store.pool().acquire().await.unwrap();
        store.read_row(&mut conn, table, key).await.unwrap()
    }
}
