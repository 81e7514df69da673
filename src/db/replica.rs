//! The embedded replica: synced data tables plus their sync bookkeeping.
//!
//! Every synced table `<t>` has a side table `<t>_sync_info` keyed by `ref`
//! (the data row's primary key). All methods take a `&mut SqliteConnection`
//! so the caller decides the transaction; the store itself never commits.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::{Row as _, SqliteConnection};
use tracing::debug;

use super::value::{bind_value, decode_row, Row, RowKey, Timestamp, Value};

/// Suffix of the per-table bookkeeping tables.
pub const SYNC_INFO_SUFFIX: &str = "_sync_info";

/// Upper bound on bind parameters in a single `IN (...)` list.
const MAX_BIND_PARAMS: usize = 500;

/// Column aliases used when joining sync info onto data rows.
const INFO_REF: &str = "_sync_info_ref_";
const INFO_LAST_MODIFIED: &str = "_sync_info_last_modified_";
const INFO_DELETED: &str = "_sync_info_deleted_";
const INFO_MODIFIED_LOCAL: &str = "_sync_info_modified_local_";

/// Errors raised by the replica store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid table name: '{0}'")]
    InvalidTableName(String),

    #[error("Table '{0}' does not exist in the replica")]
    UnknownTable(String),

    #[error("Table '{0}' is not synced")]
    NotSynced(String),

    #[error("Table '{table}' must have exactly one primary key column")]
    PrimaryKey { table: String },

    #[error("Row for table '{table}' has no primary key value")]
    MissingKey { table: String },
}

/// A validated table name.
///
/// Names are checked once when the replica is opened; afterwards they are
/// only ever interpolated through [`TableRef::quoted`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef(String);

impl TableRef {
    pub fn parse(name: &str) -> Result<Self, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && !name.to_ascii_lowercase().starts_with("sqlite_")
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(StoreError::InvalidTableName(name.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    fn quoted(&self) -> String {
        quote_ident(&self.0)
    }

    fn sync_info(&self) -> String {
        quote_ident(&format!("{}{}", self.0, SYNC_INFO_SUFFIX))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// A foreign key column of a synced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

/// Schema of a synced table as read from SQLite.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: TableRef,
    pub pk: String,
    pub columns: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Drops values for columns the local table does not have.
    fn safe_row(&self, row: &Row) -> Row {
        let mut safe = Row::new();
        for (column, value) in row {
            if self.columns.iter().any(|c| c == column) {
                safe.insert(column.clone(), value.clone());
            } else {
                debug!(table = %self.table, column = %column, "Dropping unknown column");
            }
        }
        safe
    }

    /// Primary key value of a row of this table.
    pub fn key_of(&self, row: &Row) -> Option<RowKey> {
        row.get(&self.pk).and_then(Value::as_key)
    }
}

/// Sync bookkeeping for one locally-known row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncInfo {
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub key: RowKey,
    pub last_modified: Option<Timestamp>,
    pub deleted: bool,
    pub modified_local: bool,
}

impl SyncInfo {
    /// A row acknowledged by the remote at `ts`.
    pub fn synced(key: RowKey, ts: Timestamp) -> Self {
        Self {
            key,
            last_modified: Some(ts),
            deleted: false,
            modified_local: false,
        }
    }

    /// A row whose deletion was acknowledged at `ts`.
    pub fn tombstone(key: RowKey, ts: Timestamp) -> Self {
        Self {
            key,
            last_modified: Some(ts),
            deleted: true,
            modified_local: false,
        }
    }

    /// A row created offline and never seen by the remote.
    pub fn local_insert(key: RowKey) -> Self {
        Self {
            key,
            last_modified: None,
            deleted: false,
            modified_local: true,
        }
    }

    /// Never acknowledged, or carrying unsent edits.
    pub fn is_unsynced(&self) -> bool {
        self.last_modified.is_none() || self.modified_local
    }
}

/// Which sync info records to read.
#[derive(Debug, Clone, Copy)]
pub enum SyncInfoFilter<'a> {
    All,
    Keys(&'a [RowKey]),
    ModifiedLocal,
    /// Records among `keys` that are unsynced or locally modified.
    Unsynced(&'a [RowKey]),
}

/// A locally modified row joined with its data, if the row still exists.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub info: SyncInfo,
    pub row: Option<Row>,
}

/// The local replica of the synced tables.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    pool: SqlitePool,
    tables: Vec<TableSchema>,
}

impl ReplicaStore {
    /// Opens the replica for the given ordered set of synced tables.
    ///
    /// Validates every table name, reads its schema and creates the
    /// missing `<table>_sync_info` side tables.
    pub async fn open(pool: SqlitePool, synced_tables: &[String]) -> Result<Self, StoreError> {
        let mut conn = pool.acquire().await?;
        let mut tables = Vec::with_capacity(synced_tables.len());

        for name in synced_tables {
            let table = TableRef::parse(name)?;
            let schema = Self::introspect(&mut conn, table).await?;
            Self::create_sync_info_table(&mut conn, &schema.table).await?;
            tables.push(schema);
        }

        debug!(tables = tables.len(), "Opened replica");
        Ok(Self { pool, tables })
    }

    async fn introspect(
        conn: &mut SqliteConnection,
        table: TableRef,
    ) -> Result<TableSchema, StoreError> {
        let columns: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, pk FROM pragma_table_info(?) ORDER BY cid")
                .bind(table.name())
                .fetch_all(&mut *conn)
                .await?;

        if columns.is_empty() {
            return Err(StoreError::UnknownTable(table.name().to_string()));
        }

        let pks: Vec<&String> = columns
            .iter()
            .filter(|(_, pk)| *pk > 0)
            .map(|(name, _)| name)
            .collect();
        let pk = match pks.as_slice() {
            [pk] => (*pk).clone(),
            _ => {
                return Err(StoreError::PrimaryKey {
                    table: table.name().to_string(),
                })
            }
        };

        let foreign_keys: Vec<(String, String)> =
            sqlx::query_as(r#"SELECT "from", "table" FROM pragma_foreign_key_list(?)"#)
                .bind(table.name())
                .fetch_all(&mut *conn)
                .await?;

        Ok(TableSchema {
            table,
            pk,
            columns: columns.into_iter().map(|(name, _)| name).collect(),
            foreign_keys: foreign_keys
                .into_iter()
                .map(|(column, references)| ForeignKey { column, references })
                .collect(),
        })
    }

    async fn create_sync_info_table(
        conn: &mut SqliteConnection,
        table: &TableRef,
    ) -> Result<(), StoreError> {
        let info = table.sync_info();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {info} (
                ref integer,
                last_modified timestamp,
                deleted integer,
                modified_local integer
            )"
        ))
        .execute(&mut *conn)
        .await?;

        for (suffix, column) in [
            ("ref", "ref"),
            ("lm", "last_modified"),
            ("deleted", "deleted"),
            ("ml", "modified_local"),
        ] {
            let index = quote_ident(&format!(
                "{}{}_{}_index",
                table.name(),
                SYNC_INFO_SUFFIX,
                suffix
            ));
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {info}({column})"
            ))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Synced tables in configuration order.
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn schema(&self, table: &str) -> Result<&TableSchema, StoreError> {
        self.tables
            .iter()
            .find(|s| s.table.name().eq_ignore_ascii_case(table))
            .ok_or_else(|| StoreError::NotSynced(table.to_string()))
    }

    /// Synced tables holding a foreign key into `table`, with the column.
    pub fn referencing(&self, table: &TableRef) -> Vec<(&TableSchema, &str)> {
        let mut out = Vec::new();
        for schema in &self.tables {
            for fk in &schema.foreign_keys {
                if fk.references.eq_ignore_ascii_case(table.name()) {
                    out.push((schema, fk.column.as_str()));
                }
            }
        }
        out
    }

    /// Enables or disables referential-integrity checks on a connection.
    ///
    /// SQLite ignores this inside an open transaction.
    pub async fn set_foreign_keys(
        conn: &mut SqliteConnection,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let pragma = if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };
        sqlx::query(pragma).execute(&mut *conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data rows
    // ------------------------------------------------------------------

    /// Inserts a row, replacing any row it conflicts with.
    pub async fn upsert_row(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row: &Row,
    ) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        let row = schema.safe_row(row);
        if row.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            schema.table.quoted(),
            columns.join(", "),
            placeholders(columns.len())
        );
        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        query.execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn delete_rows(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        keys: &[RowKey],
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let mut affected = 0;
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({})",
                schema.table.quoted(),
                quote_ident(&schema.pk),
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            affected += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    pub async fn read_row(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        key: RowKey,
    ) -> Result<Option<Row>, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            schema.table.quoted(),
            quote_ident(&schema.pk)
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| decode_row(&r, &[])).transpose()?)
    }

    /// All rows of a table ordered by primary key.
    pub async fn read_rows(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Vec<Row>, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            schema.table.quoted(),
            quote_ident(&schema.pk)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(decode_row(row, &[])?);
        }
        Ok(out)
    }

    /// Moves a data row to a new primary key.
    pub async fn change_key(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        from: RowKey,
        to: RowKey,
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let pk = quote_ident(&schema.pk);
        let sql = format!(
            "UPDATE {} SET {pk} = ? WHERE {pk} = ?",
            schema.table.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(to)
            .bind(from)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Rewrites a foreign key column from one referenced key to another.
    pub async fn rewrite_foreign_keys(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        from: RowKey,
        to: RowKey,
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let column = quote_ident(column);
        let sql = format!(
            "UPDATE {} SET {column} = ? WHERE {column} = ?",
            schema.table.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(to)
            .bind(from)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Values of `column` among `parent_keys` that are held by unsynced or
    /// locally modified rows of `table`.
    pub async fn referencing_unsynced(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        parent_keys: &[RowKey],
    ) -> Result<Vec<RowKey>, StoreError> {
        let schema = self.schema(table)?;
        let column = quote_ident(column);
        let mut out = Vec::new();
        for chunk in parent_keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "SELECT DISTINCT data_tbl.{column} FROM {data} AS data_tbl
                 JOIN {info} AS info_tbl ON data_tbl.{pk} = info_tbl.ref
                 WHERE data_tbl.{column} IN ({params})
                   AND (info_tbl.last_modified IS NULL OR info_tbl.modified_local = 1)",
                data = schema.table.quoted(),
                info = schema.table.sync_info(),
                pk = quote_ident(&schema.pk),
                params = placeholders(chunk.len()),
            );
            let mut query = sqlx::query_scalar::<_, RowKey>(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            out.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Sync info
    // ------------------------------------------------------------------

    pub async fn max_last_modified(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "SELECT MAX(last_modified) FROM {}",
            schema.table.sync_info()
        );
        let max: Option<Timestamp> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        Ok(max)
    }

    pub async fn read_sync_info(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        filter: SyncInfoFilter<'_>,
    ) -> Result<Vec<SyncInfo>, StoreError> {
        let schema = self.schema(table)?;
        let select = format!(
            "SELECT ref, last_modified, deleted, modified_local FROM {}",
            schema.table.sync_info()
        );

        let (keys, condition) = match filter {
            SyncInfoFilter::All => {
                let sql = format!("{select} ORDER BY ref");
                return Ok(sqlx::query_as(&sql).fetch_all(&mut *conn).await?);
            }
            SyncInfoFilter::ModifiedLocal => {
                let sql = format!("{select} WHERE modified_local = 1 ORDER BY ref");
                return Ok(sqlx::query_as(&sql).fetch_all(&mut *conn).await?);
            }
            SyncInfoFilter::Keys(keys) => (keys, ""),
            SyncInfoFilter::Unsynced(keys) => (
                keys,
                " AND (last_modified IS NULL OR modified_local = 1)",
            ),
        };

        let mut out = Vec::new();
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "{select} WHERE ref IN ({}){condition} ORDER BY ref",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_as::<_, SyncInfo>(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            out.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(out)
    }

    /// Replaces the sync info records for the given refs.
    ///
    /// Existing records are deleted first and then inserted fresh, so a
    /// ref never ends up with two records.
    pub async fn write_sync_info(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        entries: &[SyncInfo],
    ) -> Result<(), StoreError> {
        // Last entry wins when a ref is listed twice
        let latest: BTreeMap<RowKey, &SyncInfo> = entries.iter().map(|e| (e.key, e)).collect();
        let keys: Vec<RowKey> = latest.keys().copied().collect();
        self.delete_sync_info(conn, table, &keys).await?;

        let schema = self.schema(table)?;
        let sql = format!(
            "INSERT INTO {} (ref, last_modified, deleted, modified_local) VALUES (?, ?, ?, ?)",
            schema.table.sync_info()
        );
        for entry in latest.values() {
            sqlx::query(&sql)
                .bind(entry.key)
                .bind(entry.last_modified)
                .bind(entry.deleted)
                .bind(entry.modified_local)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_sync_info(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        keys: &[RowKey],
    ) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "DELETE FROM {} WHERE ref IN ({})",
                schema.table.sync_info(),
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            query.execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Turns rows back into pending inserts so the next upload re-creates them.
    pub async fn mark_for_reinsert(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        keys: &[RowKey],
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let mut affected = 0;
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "UPDATE {} SET last_modified = NULL, modified_local = 1 WHERE ref IN ({})",
                schema.table.sync_info(),
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(*key);
            }
            affected += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    /// Marks live records as deleted at `ts`. Existing tombstones are left alone.
    pub async fn tombstone(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        keys: &[RowKey],
        ts: Timestamp,
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let mut affected = 0;
        for chunk in keys.chunks(MAX_BIND_PARAMS) {
            let sql = format!(
                "UPDATE {} SET deleted = 1, last_modified = ?, modified_local = 0
                 WHERE ref IN ({}) AND deleted = 0",
                schema.table.sync_info(),
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(ts);
            for key in chunk {
                query = query.bind(*key);
            }
            affected += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    /// Points a live sync info record at a new ref.
    pub async fn rewrite_sync_ref(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        from: RowKey,
        to: RowKey,
    ) -> Result<u64, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "UPDATE {} SET ref = ? WHERE ref = ? AND deleted = 0",
            schema.table.sync_info()
        );
        let result = sqlx::query(&sql)
            .bind(to)
            .bind(from)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Every locally modified record of a table with its data row.
    pub async fn local_changes(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Vec<LocalChange>, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "SELECT info_tbl.ref AS {INFO_REF}, info_tbl.last_modified AS {INFO_LAST_MODIFIED},
                    info_tbl.deleted AS {INFO_DELETED}, info_tbl.modified_local AS {INFO_MODIFIED_LOCAL},
                    data_tbl.*
             FROM {info} AS info_tbl LEFT JOIN {data} AS data_tbl
               ON info_tbl.ref = data_tbl.{pk}
             WHERE info_tbl.modified_local = 1
             ORDER BY info_tbl.ref",
            info = schema.table.sync_info(),
            data = schema.table.quoted(),
            pk = quote_ident(&schema.pk),
        );

        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let info = SyncInfo {
                key: row.try_get(INFO_REF)?,
                last_modified: row.try_get(INFO_LAST_MODIFIED)?,
                deleted: row.try_get::<Option<bool>, _>(INFO_DELETED)?.unwrap_or(false),
                modified_local: true,
            };
            let data = decode_row(
                row,
                &[INFO_REF, INFO_LAST_MODIFIED, INFO_DELETED, INFO_MODIFIED_LOCAL],
            )?;
            let data = schema.key_of(&data).is_some().then_some(data);
            changes.push(LocalChange { info, row: data });
        }
        Ok(changes)
    }

    /// Number of locally modified rows that still have data.
    pub async fn count_offline_rows(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<i64, StoreError> {
        let schema = self.schema(table)?;
        let sql = format!(
            "SELECT COUNT(info_tbl.ref) FROM {info} AS info_tbl
             JOIN {data} AS data_tbl ON info_tbl.ref = data_tbl.{pk}
             WHERE info_tbl.modified_local = 1",
            info = schema.table.sync_info(),
            data = schema.table.quoted(),
            pk = quote_ident(&schema.pk),
        );
        Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
    }

    /// Deletes every data row and sync info record of every synced table.
    pub async fn clear_all(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        for schema in &self.tables {
            sqlx::query(&format!("DELETE FROM {}", schema.table.quoted()))
                .execute(&mut *conn)
                .await?;
            sqlx::query(&format!("DELETE FROM {}", schema.table.sync_info()))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Hex SHA-256 over the content of every synced table and its sync info.
    pub async fn digest(&self, conn: &mut SqliteConnection) -> Result<String, StoreError> {
        let mut hasher = Sha256::new();
        for schema in &self.tables {
            let name = schema.table.name();
            hasher.update(name.as_bytes());
            for row in self.read_rows(conn, name).await? {
                hasher.update(serde_json::to_vec(&row).unwrap_or_default());
            }
            let sql = format!(
                "SELECT ref, last_modified, deleted, modified_local FROM {}
                 ORDER BY ref, deleted, last_modified, modified_local",
                schema.table.sync_info()
            );
            let infos: Vec<SyncInfo> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
            for info in infos {
                hasher.update(serde_json::to_vec(&info).unwrap_or_default());
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    // ------------------------------------------------------------------
    // Local (offline) writes made by the application
    // ------------------------------------------------------------------

    /// Inserts a row created offline and records it as a pending insert.
    ///
    /// A row without a key gets one above every key the table has seen,
    /// including tombstoned refs, so later inserts receive higher keys.
    pub async fn insert_local(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row: &Row,
    ) -> Result<RowKey, StoreError> {
        let schema = self.schema(table)?;
        let mut row = schema.safe_row(row);
        let key = match schema.key_of(&row) {
            Some(key) => key,
            None => {
                let sql = format!(
                    "SELECT MAX(m) FROM (
                        SELECT MAX({pk}) AS m FROM {data}
                        UNION ALL SELECT MAX(ref) FROM {info}
                     )",
                    pk = quote_ident(&schema.pk),
                    data = schema.table.quoted(),
                    info = schema.table.sync_info(),
                );
                let max: Option<RowKey> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
                let key = max.map_or(1, |m| m.max(0) + 1);
                row.insert(schema.pk.clone(), Value::Int(key));
                key
            }
        };

        let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.table.quoted(),
            columns.join(", "),
            placeholders(columns.len())
        );
        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        query.execute(&mut *conn).await?;

        self.write_sync_info(conn, table, &[SyncInfo::local_insert(key)])
            .await?;
        Ok(key)
    }

    /// Updates a row offline and flags it for upload.
    pub async fn update_local(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row: &Row,
    ) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        let row = schema.safe_row(row);
        let key = schema.key_of(&row).ok_or_else(|| StoreError::MissingKey {
            table: table.to_string(),
        })?;

        let assignments: Vec<(&String, &Value)> =
            row.iter().filter(|(c, _)| **c != schema.pk).collect();
        if !assignments.is_empty() {
            let set: Vec<String> = assignments
                .iter()
                .map(|(c, _)| format!("{} = ?", quote_ident(c)))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                schema.table.quoted(),
                set.join(", "),
                quote_ident(&schema.pk)
            );
            let mut query = sqlx::query(&sql);
            for (_, value) in &assignments {
                query = bind_value(query, value);
            }
            query.bind(key).execute(&mut *conn).await?;
        }

        let existing = self
            .read_sync_info(conn, table, SyncInfoFilter::Keys(&[key]))
            .await?;
        if existing.is_empty() {
            self.write_sync_info(conn, table, &[SyncInfo::local_insert(key)])
                .await?;
        } else {
            let sql = format!(
                "UPDATE {} SET modified_local = 1 WHERE ref = ? AND deleted = 0",
                schema.table.sync_info()
            );
            sqlx::query(&sql).bind(key).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Deletes a row offline.
    ///
    /// A row the remote already knows keeps a pending-delete record; a row
    /// that never reached the remote simply disappears.
    pub async fn delete_local(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        key: RowKey,
    ) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        self.delete_rows(conn, table, &[key]).await?;

        let existing = self
            .read_sync_info(conn, table, SyncInfoFilter::Keys(&[key]))
            .await?;
        match existing.first() {
            None => {}
            Some(info) if info.last_modified.is_none() => {
                self.delete_sync_info(conn, table, &[key]).await?;
            }
            Some(_) => {
                let sql = format!(
                    "UPDATE {} SET deleted = 1, modified_local = 1 WHERE ref = ?",
                    schema.table.sync_info()
                );
                sqlx::query(&sql).bind(key).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine config area
    // ------------------------------------------------------------------

    pub async fn get_config(
        conn: &mut SqliteConnection,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar("SELECT value FROM _sync_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(value)
    }

    pub async fn set_config(
        conn: &mut SqliteConnection,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _sync_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_config(conn: &mut SqliteConnection, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM _sync_config WHERE key = ?")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
