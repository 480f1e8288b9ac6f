// ABOUTME: Transactional embedded tier backed by SQLite, with named key-value collections.
// ABOUTME: Also owns the timestamp-indexed snapshot table used for history and range pruning.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::tier::{StorageTier, TierCapabilities, TierError, TierName, TierScope};

/// Collection used when the tier is driven through the generic StorageTier contract.
pub const DEFAULT_COLLECTION: &str = "app";

/// A snapshot row as stored in the `snapshots` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub timestamp_ms: i64,
    pub kind: String,
    pub checksum: String,
    pub count: i64,
    pub metadata: String,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

/// SQLite-backed tier. The connection is guarded by a mutex; each call is one short
/// statement or transaction.
pub struct EmbeddedTier {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> TierError {
    TierError::backend(TierName::Embedded, e)
}

impl EmbeddedTier {
    /// Open or create the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, TierError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TierError::Io {
                tier: TierName::Embedded,
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        Self::migrate(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, TierError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::migrate(conn)
    }

    fn migrate(conn: Connection) -> Result<Self, TierError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                timestamp INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                checksum TEXT NOT NULL,
                count INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                payload BLOB NOT NULL,
                compressed INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS snapshots_kind_ts ON snapshots (kind, timestamp);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TierError> {
        self.conn
            .lock()
            .map_err(|_| TierError::unavailable(TierName::Embedded, "connection lock poisoned"))
    }

    /// Upsert a value into a named collection.
    pub fn put_in(&self, collection: &str, key: &str, value: &str) -> Result<(), TierError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![collection, key, value, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_in(&self, collection: &str, key: &str) -> Result<Option<String>, TierError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn delete_in(&self, collection: &str, key: &str) -> Result<(), TierError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM kv WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn keys_in(&self, collection: &str, prefix: &str) -> Result<Vec<String>, TierError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE collection = ?1 ORDER BY key ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut keys = Vec::new();
        for row in rows {
            let key = row.map_err(db_err)?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Insert an immutable snapshot row. If a row already exists at the requested
    /// millisecond the timestamp is advanced to the next free one, never overwritten.
    /// Returns the timestamp actually used.
    pub fn insert_snapshot(&self, snapshot: &StoredSnapshot) -> Result<i64, TierError> {
        self.insert_snapshot_with(snapshot, |_| Ok(snapshot.metadata.clone()))
    }

    /// Like `insert_snapshot`, but the metadata column is rendered by `metadata_at`
    /// for the timestamp the row actually lands on.
    pub fn insert_snapshot_with<F>(&self, snapshot: &StoredSnapshot, metadata_at: F) -> Result<i64, TierError>
    where
        F: FnOnce(i64) -> Result<String, TierError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let mut timestamp = snapshot.timestamp_ms;
        loop {
            let taken: Option<i64> = tx
                .query_row(
                    "SELECT timestamp FROM snapshots WHERE timestamp = ?1",
                    params![timestamp],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if taken.is_none() {
                break;
            }
            timestamp += 1;
        }
        let metadata = metadata_at(timestamp)?;

        tx.execute(
            "INSERT INTO snapshots (timestamp, kind, checksum, count, metadata, payload, compressed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                timestamp,
                snapshot.kind,
                snapshot.checksum,
                snapshot.count,
                metadata,
                snapshot.payload,
                snapshot.compressed,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(timestamp)
    }

    pub fn latest_snapshot(&self) -> Result<Option<StoredSnapshot>, TierError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT timestamp, kind, checksum, count, metadata, payload, compressed
             FROM snapshots ORDER BY timestamp DESC LIMIT 1",
            [],
            row_to_snapshot,
        )
        .optional()
        .map_err(db_err)
    }

    /// All snapshots newest first. Payloads are omitted (left empty).
    pub fn list_snapshots(&self) -> Result<Vec<StoredSnapshot>, TierError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, kind, checksum, count, metadata, X'', compressed
                 FROM snapshots ORDER BY timestamp DESC",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_snapshot).map_err(db_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.map_err(db_err)?);
        }
        Ok(snapshots)
    }

    /// Range delete over the timestamp index. Returns the number of rows removed.
    pub fn delete_snapshots_before(&self, cutoff_ms: i64) -> Result<usize, TierError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM snapshots WHERE timestamp < ?1",
            params![cutoff_ms],
        )
        .map_err(db_err)
    }

    pub fn snapshot_count(&self) -> Result<usize, TierError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSnapshot> {
    Ok(StoredSnapshot {
        timestamp_ms: row.get(0)?,
        kind: row.get(1)?,
        checksum: row.get(2)?,
        count: row.get(3)?,
        metadata: row.get(4)?,
        payload: row.get(5)?,
        compressed: row.get(6)?,
    })
}

#[async_trait]
impl StorageTier for EmbeddedTier {
    fn name(&self) -> TierName {
        TierName::Embedded
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            synchronous: false,
            max_entry_size_bytes: None,
            scope: TierScope::PersistentDevice,
            queryable: true,
        }
    }

    async fn is_ready(&self) -> bool {
        self.conn.lock().is_ok()
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.put_in(DEFAULT_COLLECTION, key, value)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        self.get_in(DEFAULT_COLLECTION, key)
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.delete_in(DEFAULT_COLLECTION, key)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.keys_in(DEFAULT_COLLECTION, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(ts: i64) -> StoredSnapshot {
        StoredSnapshot {
            timestamp_ms: ts,
            kind: "auto".to_string(),
            checksum: format!("sum-{ts}"),
            count: 1,
            metadata: "{}".to_string(),
            payload: b"[]".to_vec(),
            compressed: false,
        }
    }

    #[tokio::test]
    async fn kv_round_trip_through_tier_contract() {
        let tier = EmbeddedTier::open_in_memory().unwrap();

        tier.write("k", "v1").await.unwrap();
        tier.write("k", "v2").await.unwrap();
        assert_eq!(tier.read("k").await.unwrap().as_deref(), Some("v2"));

        tier.clear("k").await.unwrap();
        assert!(tier.read("k").await.unwrap().is_none());
    }

    #[test]
    fn collections_are_isolated() {
        let tier = EmbeddedTier::open_in_memory().unwrap();
        tier.put_in("states", "k", "a").unwrap();
        tier.put_in("queue", "k", "b").unwrap();

        assert_eq!(tier.get_in("states", "k").unwrap().as_deref(), Some("a"));
        assert_eq!(tier.get_in("queue", "k").unwrap().as_deref(), Some("b"));
        assert_eq!(tier.keys_in("states", "").unwrap(), vec!["k"]);
    }

    #[test]
    fn snapshots_are_never_overwritten() {
        let tier = EmbeddedTier::open_in_memory().unwrap();

        let first = tier.insert_snapshot(&snapshot(1_000)).unwrap();
        let second = tier.insert_snapshot(&snapshot(1_000)).unwrap();
        let older = tier.insert_snapshot(&snapshot(500)).unwrap();

        assert_eq!(first, 1_000);
        assert_eq!(second, 1_001);
        assert_eq!(older, 500);
        assert_eq!(tier.snapshot_count().unwrap(), 3);
        assert_eq!(tier.latest_snapshot().unwrap().unwrap().timestamp_ms, 1_001);
    }

    #[test]
    fn range_delete_removes_only_older_rows() {
        let tier = EmbeddedTier::open_in_memory().unwrap();
        for ts in [100, 200, 300, 400] {
            tier.insert_snapshot(&snapshot(ts)).unwrap();
        }

        let removed = tier.delete_snapshots_before(300).unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<i64> = tier
            .list_snapshots()
            .unwrap()
            .iter()
            .map(|s| s.timestamp_ms)
            .collect();
        assert_eq!(remaining, vec![400, 300]);
    }

    #[test]
    fn reopens_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parcelkeep.db");
        {
            let tier = EmbeddedTier::open(&path).unwrap();
            tier.put_in(DEFAULT_COLLECTION, "k", "v").unwrap();
            tier.insert_snapshot(&snapshot(42)).unwrap();
        }
        let tier = EmbeddedTier::open(&path).unwrap();
        assert_eq!(tier.get_in(DEFAULT_COLLECTION, "k").unwrap().as_deref(), Some("v"));
        assert_eq!(tier.snapshot_count().unwrap(), 1);
    }
}
