//! Lease store backed by a transactional SQLite database
//!
//! SQLite has no native TTL, so every guard condition is expressed in SQL and
//! decided by affected-row counts: acquire is a single upsert that only fires
//! when the existing row has expired, renew and release are guarded by a
//! `participant_id = ?` predicate. An optional background sweep deletes
//! expired rows proactively; correctness never depends on it because reads
//! treat an expired row as absent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ElectionError, Result};
use crate::lease::LeaseRecord;
use crate::store::LeaseStore;

/// Default lease table name
pub const DEFAULT_TABLE_NAME: &str = "leasehold_leases";

/// Configuration for [`SqliteLeaseStore`]
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// Name of the lease table
    pub table_name: String,
    /// Create the table (and indexes) if missing
    pub create_table: bool,
    /// When set, a background task deletes expired rows at this interval
    pub cleanup_interval: Option<Duration>,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            create_table: true,
            cleanup_interval: None,
        }
    }
}

impl SqliteStoreOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease table name (validated at store construction)
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Control automatic table creation
    pub fn with_create_table(mut self, create_table: bool) -> Self {
        self.create_table = create_table;
        self
    }

    /// Enable the periodic expired-row sweep
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }
}

/// Lease store over a SQLite connection
///
/// The connection is guarded by an async mutex and every operation is a
/// single statement, so the check-then-act of each contract operation is
/// atomic at the database level even with several store instances pointed at
/// the same file.
pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
    acquire_sql: String,
    renew_sql: String,
    release_sql: String,
    select_sql: String,
    delete_expired_sql: String,
    sweep_cancel: Option<CancellationToken>,
}

impl SqliteLeaseStore {
    /// Open (or create) a database file and build a store with default options
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, SqliteStoreOptions::default())
    }

    /// Open (or create) a database file with explicit options
    ///
    /// When `cleanup_interval` is set this must run inside a tokio runtime,
    /// because the sweep task is spawned here.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: SqliteStoreOptions,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Writers briefly block each other across processes; retry instead of
        // surfacing SQLITE_BUSY for short contention.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn, options)
    }

    /// Build a store over an already-open connection
    pub fn from_connection(conn: Connection, options: SqliteStoreOptions) -> Result<Self> {
        validate_table_name(&options.table_name)?;
        let table = &options.table_name;

        if options.create_table {
            conn.execute_batch(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{table}" (
                    election_name  TEXT PRIMARY KEY,
                    participant_id TEXT NOT NULL,
                    acquired_at    INTEGER NOT NULL,
                    expires_at     INTEGER NOT NULL,
                    metadata       TEXT
                );
                CREATE INDEX IF NOT EXISTS "idx_{table}_expires"
                    ON "{table}"(expires_at);"#
            ))?;
        }

        let acquire_sql = format!(
            r#"INSERT INTO "{table}" (election_name, participant_id, acquired_at, expires_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(election_name) DO UPDATE SET
                   participant_id = excluded.participant_id,
                   acquired_at    = excluded.acquired_at,
                   expires_at     = excluded.expires_at,
                   metadata       = excluded.metadata
               WHERE "{table}".expires_at <= excluded.acquired_at"#
        );
        let renew_sql = format!(
            r#"UPDATE "{table}"
               SET acquired_at = ?3, expires_at = ?4, metadata = ?5
               WHERE election_name = ?1 AND participant_id = ?2"#
        );
        let release_sql = format!(
            r#"DELETE FROM "{table}" WHERE election_name = ?1 AND participant_id = ?2"#
        );
        let select_sql = format!(
            r#"SELECT participant_id, acquired_at, expires_at, metadata
               FROM "{table}" WHERE election_name = ?1"#
        );
        let delete_expired_sql =
            format!(r#"DELETE FROM "{table}" WHERE expires_at <= ?1"#);

        let conn = Arc::new(Mutex::new(conn));
        let sweep_cancel = options.cleanup_interval.map(|interval| {
            let cancel = CancellationToken::new();
            spawn_sweep(
                Arc::clone(&conn),
                delete_expired_sql.clone(),
                interval,
                cancel.clone(),
            );
            cancel
        });

        Ok(Self {
            conn,
            acquire_sql,
            renew_sql,
            release_sql,
            select_sql,
            delete_expired_sql,
            sweep_cancel,
        })
    }

    fn encode_metadata(metadata: Option<&HashMap<String, String>>) -> Result<Option<String>> {
        metadata
            .map(|m| serde_json::to_string(m).map_err(ElectionError::from))
            .transpose()
    }
}

impl Drop for SqliteLeaseStore {
    fn drop(&mut self) {
        if let Some(cancel) = &self.sweep_cancel {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let now = Utc::now();
        let record = LeaseRecord::new(participant_id, lease_duration, metadata.cloned(), now);
        let metadata_json = Self::encode_metadata(metadata)?;

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &self.acquire_sql,
            params![
                election_name,
                participant_id,
                record.acquired_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                metadata_json,
            ],
        )?;

        Ok((changed > 0).then_some(record))
    }

    async fn try_renew(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let now = Utc::now();
        let record = LeaseRecord::new(participant_id, lease_duration, metadata.cloned(), now);
        let metadata_json = Self::encode_metadata(metadata)?;

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &self.renew_sql,
            params![
                election_name,
                participant_id,
                record.acquired_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                metadata_json,
            ],
        )?;

        Ok((changed > 0).then_some(record))
    }

    async fn release(&self, election_name: &str, participant_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(&self.release_sql, params![election_name, participant_id])?;
        Ok(changed > 0)
    }

    async fn get_current(&self, election_name: &str) -> Result<Option<LeaseRecord>> {
        let conn = self.conn.lock().await;

        let row: Option<(String, i64, i64, Option<String>)> = conn
            .query_row(&self.select_sql, params![election_name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .optional()?;

        let Some((participant_id, acquired_ms, expires_ms, metadata_json)) = row else {
            return Ok(None);
        };

        let now_ms = Utc::now().timestamp_millis();
        if expires_ms <= now_ms {
            // No native TTL here: an expired row reads as absent and is
            // cleaned up lazily. The expiry predicate keeps the delete from
            // racing a concurrent re-acquire that wrote a fresh row.
            conn.execute(&self.delete_expired_sql, params![now_ms])?;
            return Ok(None);
        }

        let metadata = metadata_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?;

        Ok(Some(LeaseRecord {
            participant_id,
            acquired_at: millis_to_datetime(acquired_ms)?,
            expires_at: millis_to_datetime(expires_ms)?,
            metadata,
        }))
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| ElectionError::store(format!("timestamp out of range: {ms}")))
}

fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ElectionError::InvalidTableName(name.to_string()))
    }
}

fn spawn_sweep(
    conn: Arc<Mutex<Connection>>,
    delete_expired_sql: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let now_ms = Utc::now().timestamp_millis();
            let conn = conn.lock().await;
            match conn.execute(&delete_expired_sql, params![now_ms]) {
                Ok(0) => {}
                Ok(swept) => debug!(swept, "expired leases removed"),
                Err(e) => warn!(error = %e, "lease sweep failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SqliteLeaseStore {
        let conn = Connection::open_in_memory().unwrap();
        SqliteLeaseStore::from_connection(conn, SqliteStoreOptions::default()).unwrap()
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("leasehold_leases").is_ok());
        assert!(validate_table_name("_private").is_ok());
        assert!(validate_table_name("app-leases-v2").is_ok());

        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1leases").is_err());
        assert!(validate_table_name("-leading-hyphen").is_err());
        assert!(validate_table_name("bad name").is_err());
        assert!(validate_table_name("drop;table").is_err());
        assert!(validate_table_name("quo\"te").is_err());
    }

    #[test]
    fn test_invalid_table_name_fails_at_construction() {
        let conn = Connection::open_in_memory().unwrap();
        let result = SqliteLeaseStore::from_connection(
            conn,
            SqliteStoreOptions::new().with_table_name("no spaces allowed"),
        );
        assert!(matches!(result, Err(ElectionError::InvalidTableName(_))));
    }

    #[tokio::test]
    async fn test_acquire_blocks_second_participant() {
        let store = memory_store();

        let first = store
            .try_acquire("job-x", "p1", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .try_acquire("job-x", "p2", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(second.is_none());

        let current = store.get_current("job-x").await.unwrap().unwrap();
        assert_eq!(current.participant_id, "p1");
    }

    #[tokio::test]
    async fn test_renew_and_release_are_holder_only() {
        let store = memory_store();
        store
            .try_acquire("job-x", "p1", Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .try_renew("job-x", "p2", Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none());
        assert!(!store.release("job-x", "p2").await.unwrap());

        let current = store.get_current("job-x").await.unwrap().unwrap();
        assert_eq!(current.participant_id, "p1");

        let renewed = store
            .try_renew("job-x", "p1", Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();
        assert!(renewed.expires_at >= current.expires_at);

        assert!(store.release("job-x", "p1").await.unwrap());
        assert!(store.get_current("job-x").await.unwrap().is_none());
        // Releasing again is "nothing to release", not an error.
        assert!(!store.release("job-x", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_row_reads_absent_and_is_replaceable() {
        let store = memory_store();
        store
            .try_acquire("job-x", "p1", Duration::from_millis(20), None)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get_current("job-x").await.unwrap().is_none());
        assert!(!store.has_valid("job-x").await.unwrap());

        let taken = store
            .try_acquire("job-x", "p2", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert_eq!(taken.unwrap().participant_id, "p2");
    }

    #[tokio::test]
    async fn test_metadata_round_trips() {
        let store = memory_store();
        let mut metadata = HashMap::new();
        metadata.insert("host".to_string(), "node-3".to_string());

        store
            .try_acquire("job-x", "p1", Duration::from_secs(30), Some(&metadata))
            .await
            .unwrap()
            .unwrap();

        let current = store.get_current("job-x").await.unwrap().unwrap();
        assert_eq!(current.metadata, Some(metadata));
    }

    #[tokio::test]
    async fn test_takeover_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");

        let store_a = SqliteLeaseStore::open(&path).unwrap();
        let store_b = SqliteLeaseStore::open(&path).unwrap();

        store_a
            .try_acquire("job-x", "p1", Duration::from_millis(20), None)
            .await
            .unwrap()
            .unwrap();

        // Valid lease blocks the other process.
        assert!(store_b
            .try_acquire("job-x", "p2", Duration::from_secs(30), None)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Simulated crash of p1: no release, expiry alone frees the lease.
        let taken = store_b
            .try_acquire("job-x", "p2", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert_eq!(taken.unwrap().participant_id, "p2");
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");

        let store = SqliteLeaseStore::open_with_options(
            &path,
            SqliteStoreOptions::new().with_cleanup_interval(Duration::from_millis(25)),
        )
        .unwrap();

        store
            .try_acquire("job-x", "p1", Duration::from_millis(10), None)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        // The sweep deleted the row directly; no read-path cleanup involved.
        let conn = store.conn.lock().await;
        let count: i64 = conn
            .query_row(
                &format!(r#"SELECT COUNT(*) FROM "{DEFAULT_TABLE_NAME}""#),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let conn = Connection::open_in_memory().unwrap();
        let store = SqliteLeaseStore::from_connection(
            conn,
            SqliteStoreOptions::new().with_table_name("my-app-leases"),
        )
        .unwrap();

        store
            .try_acquire("job-x", "p1", Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();
        assert!(store.has_valid("job-x").await.unwrap());
    }
}
